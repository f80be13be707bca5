use crate::adapter::{DeclarativeTool, ToolAdapter};
use crate::benchmark::{Benchmark, MetadataBenchmark};
use crate::config::LoadedConfig;
use anyhow::{anyhow, Result};
use apr_core::{MatrixError, ToolName};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Tools and benchmarks available to a run. Built once at startup and
/// passed by reference to whatever needs a lookup.
#[derive(Clone, Default)]
pub struct Registry {
    tools: BTreeMap<ToolName, Arc<dyn ToolAdapter>>,
    benchmarks: BTreeMap<String, Arc<dyn Benchmark>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(loaded: &LoadedConfig) -> Result<Self> {
        let mut registry = Self::new();
        for bench in &loaded.config.benchmarks {
            let setup_dir = bench.setup_dir.as_deref().map(|p| loaded.resolve(p));
            let benchmark =
                MetadataBenchmark::load(&bench.name, &loaded.resolve(&bench.metadata), setup_dir)?;
            registry.register_benchmark(Arc::new(benchmark))?;
        }
        for tool in &loaded.config.tools {
            let adapter = DeclarativeTool::from_config(tool, &loaded.base_dir)?;
            registry.register_tool(Arc::new(adapter))?;
        }
        Ok(registry)
    }

    pub fn register_tool(&mut self, adapter: Arc<dyn ToolAdapter>) -> Result<()> {
        let name = adapter.name().clone();
        if self.tools.contains_key(&name) {
            return Err(anyhow!("tool '{}' is registered twice", name));
        }
        self.tools.insert(name, adapter);
        Ok(())
    }

    pub fn register_benchmark(&mut self, benchmark: Arc<dyn Benchmark>) -> Result<()> {
        let name = benchmark.name().to_string();
        if self.benchmarks.contains_key(&name) {
            return Err(anyhow!("benchmark '{}' is registered twice", name));
        }
        self.benchmarks.insert(name, benchmark);
        Ok(())
    }

    pub fn tool(&self, name: &str) -> Result<&Arc<dyn ToolAdapter>, MatrixError> {
        let key = ToolName::new(name).map_err(|_| MatrixError::UnknownTool(name.to_string()))?;
        self.tools
            .get(&key)
            .ok_or_else(|| MatrixError::UnknownTool(name.to_string()))
    }

    pub fn benchmark(&self, name: &str) -> Result<&Arc<dyn Benchmark>, MatrixError> {
        self.benchmarks
            .get(name)
            .ok_or_else(|| MatrixError::UnknownBenchmark(name.to_string()))
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().map(|t| t.to_string()).collect()
    }

    pub fn benchmark_names(&self) -> Vec<String> {
        self.benchmarks.keys().cloned().collect()
    }
}
