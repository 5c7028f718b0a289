use anyhow::Context;
use roompot_core::{
    AggregateSink, EngineConfig, HttpAggregateSink, HttpLedgerGateway, LedgerGateway,
    LocalLedger, LoggingAggregateSink, RoomManager, Storage,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct CliConfig {
    pub data_dir: PathBuf,
    pub engine: EngineConfig,
}

impl CliConfig {
    pub fn load(data_dir: PathBuf, config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = config_path.unwrap_or_else(|| data_dir.join("roompot.json"));
        let engine = EngineConfig::load(&path)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(Self { data_dir, engine })
    }

    /// Wire storage, ledger and read model according to the config.
    ///
    /// Without a `ledger_url` escrow is kept in the local database.
    pub async fn build_manager(&self) -> anyhow::Result<Arc<RoomManager>> {
        let db_path = self.data_dir.join("roompot.db");
        let storage = Arc::new(
            Storage::new(&db_path)
                .await
                .with_context(|| format!("cannot open {}", db_path.display()))?,
        );

        let ledger: Arc<dyn LedgerGateway> = match &self.engine.ledger_url {
            Some(url) => {
                tracing::debug!("Using escrow ledger at {}", url);
                Arc::new(HttpLedgerGateway::new(url.clone(), self.engine.ledger_timeout)?)
            }
            None => Arc::new(LocalLedger::new(storage.clone())),
        };

        let sink: Arc<dyn AggregateSink> = match &self.engine.read_model_url {
            Some(url) => Arc::new(HttpAggregateSink::new(url.clone(), self.engine.ledger_timeout)?),
            None => Arc::new(LoggingAggregateSink),
        };

        let manager = RoomManager::new(storage, ledger, sink, self.engine.clone())?;
        Ok(Arc::new(manager))
    }
}
