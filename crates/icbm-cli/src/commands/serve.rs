use std::sync::Arc;

use icbm_core::{EngineConfig, Ingestor, Store, TapRegistry};
use icbm_server::{ApiKeyTable, CredentialCheck, ServerConfig};

pub fn run(engine: EngineConfig, server: ServerConfig) {
    if let Err(e) = std::fs::create_dir_all(&engine.data_dir) {
        eprintln!(
            "Error: cannot create data directory '{}': {e}",
            engine.data_dir.display()
        );
        std::process::exit(1);
    }

    let credentials = load_credentials(&server);

    let registry = Arc::new(TapRegistry::new());
    if let Err(e) = icbm_core::rehydrate(&Store::new(&engine.data_dir), &registry, engine.retention) {
        log::error!("rehydration failed, starting empty: {e}");
    }

    println!("icbm v{}", icbm_core::VERSION);
    println!("   http://{}", server.listen);
    println!("   data in {}, {} taps loaded", engine.data_dir.display(), registry.len());
    println!();
    println!("   Endpoints:");
    println!("     POST /icbm/v1        Submit telemetry (header: {})", icbm_server::API_KEY_HEADER);
    println!("     GET  /status/<tap>   Summary of a tap");
    println!("     GET  /health         Health check");
    println!("     GET  /version        Server version");
    println!();

    let ingestor = Ingestor::new(engine, registry);
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: cannot start async runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(icbm_server::run_server(server, ingestor, credentials)) {
        eprintln!("Error: server failed: {e}");
        std::process::exit(1);
    }
}

fn load_credentials(server: &ServerConfig) -> Option<Arc<dyn CredentialCheck>> {
    let path = server.users_path.as_ref()?;
    match ApiKeyTable::load(path) {
        Ok(table) => {
            log::info!("loaded {} API keys from {}", table.len(), path.display());
            Some(Arc::new(table) as Arc<dyn CredentialCheck>)
        }
        Err(e) => {
            log::error!("could not load user database, server will be read-only: {e}");
            None
        }
    }
}
