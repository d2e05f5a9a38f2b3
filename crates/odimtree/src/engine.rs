use crate::config::EngineConfig;
use crate::diagnostics::Diagnostics;

/// Entry point for reading and writing collections.
///
/// The engine holds no file state between calls. Its diagnostics sink and
/// configuration apply to every operation run through it.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    pub(crate) diagnostics: Diagnostics,
    pub(crate) config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig, diagnostics: Diagnostics) -> Engine {
        Engine {
            diagnostics,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }
}
