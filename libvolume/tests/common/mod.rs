use std::sync::Arc;

use libvolume::backend::MemoryBackend;
use libvolume::{EngineConfig, ReconcileEngine};

/// Install a fmt subscriber honouring `RUST_LOG`.  Safe to call from every test.
pub fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn engine_with(
    backend: MemoryBackend,
    config: EngineConfig,
) -> (Arc<MemoryBackend>, ReconcileEngine<MemoryBackend>) {
    let backend = Arc::new(backend);
    let engine = ReconcileEngine::new(Arc::clone(&backend), config);
    (backend, engine)
}

pub fn engine() -> (Arc<MemoryBackend>, ReconcileEngine<MemoryBackend>) {
    engine_with(MemoryBackend::new(), EngineConfig::default())
}
