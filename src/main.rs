use std::env;
use std::process::exit;
use std::sync::Arc;
use std::time::Instant;

use log::{error, info};
use rudis::config::{self, ServerConfig};
use rudis::db::DB;
use rudis::handler::RespHandler;
use rudis::{logger, server};

fn main() {
    let args: Vec<String> = env::args().collect();
    let cfg = match args.len() {
        1 => {
            eprintln!(
                "Warning: no config file specified, using the default config. \
                 In order to specify a config file use 'rudis-server /path/to/rudis.yaml'"
            );
            ServerConfig::default()
        }
        2 => match config::load(&args[1]) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("can't load config {}: {}", args[1], e);
                exit(1);
            }
        },
        _ => {
            eprintln!("Usage: rudis-server [/path/to/rudis.yaml]");
            exit(1);
        }
    };

    if let Err(e) = logger::setup(&cfg.logging) {
        eprintln!("can't set up logging: {}", e);
    }

    let start = Instant::now();
    let db = Arc::new(DB::new(&cfg));
    if cfg.appendonly {
        info!(
            "DB loaded from append only file: {:.3} seconds",
            start.elapsed().as_secs_f64()
        );
    }

    let handler = Arc::new(RespHandler::new(
        db.clone(),
        cfg.max_connect,
        cfg.timeout_duration(),
    ));
    if let Err(e) = server::listen_and_serve_with_signal(&cfg, handler) {
        error!("server failed: {}", e);
        exit(1);
    }

    db.close();
}
