//! Errors raised by the engine's compile/instantiate/cache entry points.
//! Never constructed from native code — only the host-side driver sees these.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("function `{function}` in module `{module}` failed to compile: {source}")]
    Compile {
        module: String,
        function: String,
        #[source]
        source: wazine_codegen::CodegenError,
    },

    #[error("cache I/O error for module `{module}`: {source}")]
    CacheIo {
        module: String,
        #[source]
        source: std::io::Error,
    },

    #[error("module `{0}` is stale in cache (magic/version mismatch)")]
    StaleCache(String),

    #[error("failed to map executable pages for module `{module}`: {source}")]
    CodeMap {
        module: String,
        #[source]
        source: region::Error,
    },

    #[error("no module named `{0}` is registered")]
    UnknownModule(String),

    #[error("module `{0}` is closed")]
    ModuleClosed(String),
}
