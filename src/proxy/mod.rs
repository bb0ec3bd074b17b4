//! Proxy wiring
//!
//! [`ProxyState`] bundles what every connection shares: the configuration,
//! the callout collaborators built from it, and the forwarding stage.

pub mod upstream;

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::callout::context::Services;
use crate::callout::helper::ProgramHelper;
use crate::callout::rules::RuleChecklist;
use crate::config::{Config, ConfigError, SharedConfig};

pub use upstream::{ForwardStage, OriginForwarder};

#[derive(Clone)]
pub struct ProxyState {
    pub config: SharedConfig,
    services: Arc<ArcSwap<Services>>,
    pub forwarder: Arc<dyn ForwardStage>,
}

impl ProxyState {
    pub fn new(config: SharedConfig, services: Services, forwarder: Arc<dyn ForwardStage>) -> Self {
        Self {
            config,
            services: Arc::new(ArcSwap::from_pointee(services)),
            forwarder,
        }
    }

    /// Builds the default collaborators: rule checklist, program helpers and
    /// the origin forwarder.
    pub fn from_config(cfg: Config) -> Result<Self, ConfigError> {
        let services = build_services(&cfg)?;
        Ok(Self::new(
            SharedConfig::new(cfg),
            services,
            Arc::new(OriginForwarder::new()),
        ))
    }

    pub fn services(&self) -> Arc<Services> {
        self.services.load_full()
    }

    /// Reloads configuration and rebuilds the collaborators.
    ///
    /// Transactions already running keep the snapshot they started with.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let cfg = Config::load()?;
        let services = build_services(&cfg)?;
        self.services.store(Arc::new(services));
        self.config.replace(cfg);
        Ok(())
    }
}

fn build_services(cfg: &Config) -> Result<Services, ConfigError> {
    let checklist = RuleChecklist::from_config(&cfg.access)?;
    let mut services = Services::new(Arc::new(checklist));

    if let Some(helper) = &cfg.redirector {
        services = services.with_redirector(Arc::new(ProgramHelper::new(
            "redirector",
            helper.program.clone(),
        )));
    }
    if let Some(helper) = &cfg.store_id {
        services = services.with_store_id(Arc::new(ProgramHelper::new(
            "store_id",
            helper.program.clone(),
        )));
    }

    Ok(services)
}
