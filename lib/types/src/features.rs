//! Controls which WebAssembly proposals the loaders accept.

/// Controls which experimental features will be enabled.
/// Features usually have a corresponding [WebAssembly proposal].
///
/// [WebAssembly proposal]: https://github.com/WebAssembly/proposals
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Features {
    /// Threads proposal should be enabled
    pub threads: bool,
    /// Reference Types proposal should be enabled
    pub reference_types: bool,
    /// SIMD proposal should be enabled
    pub simd: bool,
    /// Bulk Memory proposal should be enabled
    pub bulk_memory: bool,
    /// Multi Value proposal should be enabled
    pub multi_value: bool,
    /// Multi Memory proposal should be enabled
    pub multi_memory: bool,
    /// Wasm exceptions proposal should be enabled
    pub exceptions: bool,
}

impl Features {
    /// Create a new feature set with the default features enabled.
    pub fn new() -> Self {
        Self {
            threads: true,
            // Reference types should be on by default
            reference_types: true,
            // SIMD should be on by default
            simd: true,
            // Bulk Memory should be on by default
            bulk_memory: true,
            // Multivalue should be on by default
            multi_value: true,
            multi_memory: false,
            exceptions: true,
        }
    }

    /// Configures whether the WebAssembly threads proposal will be enabled.
    pub fn threads(&mut self, enable: bool) -> &mut Self {
        self.threads = enable;
        self
    }

    /// Configures whether the WebAssembly reference types proposal will be
    /// enabled.
    pub fn reference_types(&mut self, enable: bool) -> &mut Self {
        self.reference_types = enable;
        self
    }

    /// Configures whether the WebAssembly SIMD proposal will be enabled.
    pub fn simd(&mut self, enable: bool) -> &mut Self {
        self.simd = enable;
        self
    }

    /// Configures whether the WebAssembly bulk memory operations proposal
    /// will be enabled.
    pub fn bulk_memory(&mut self, enable: bool) -> &mut Self {
        self.bulk_memory = enable;
        self
    }

    /// Configures whether the WebAssembly multi-value proposal will be
    /// enabled.
    pub fn multi_value(&mut self, enable: bool) -> &mut Self {
        self.multi_value = enable;
        self
    }

    /// Configures whether the WebAssembly multi-memory proposal will be
    /// enabled.
    pub fn multi_memory(&mut self, enable: bool) -> &mut Self {
        self.multi_memory = enable;
        self
    }

    /// Configures whether the WebAssembly exception-handling proposal will
    /// be enabled.
    pub fn exceptions(&mut self, enable: bool) -> &mut Self {
        self.exceptions = enable;
        self
    }
}

impl Default for Features {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_features() {
        let default = Features::default();
        assert!(default.simd);
        assert!(default.threads);
        assert!(!default.multi_memory);
    }

    #[test]
    fn builder_chain() {
        let mut features = Features::new();
        features.multi_memory(true).simd(false);
        assert!(features.multi_memory);
        assert!(!features.simd);
    }
}
