//! Compile sessions: one graph, one arena, one pipeline run.

use std::path::Path;

use opgraph_ir::{
    Graph, GraphConfig, GraphPhase, MemoryPlan, OptimizeStats, RuntimeHandle,
};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span};

use crate::arena::{ArenaAllocator, ArenaConfig};
use crate::error::{SessionError, SessionResult};
use crate::logging::{init_logging, LoggingConfig};

/// Everything a [`Session`] needs, loadable from one JSON document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub graph: GraphConfig,
    pub arena: ArenaConfig,
    /// Subscriber to install with [`Session::install_logging`]; none by default.
    pub logging: Option<LoggingConfig>,
}

impl SessionConfig {
    pub fn with_graph(mut self, graph: GraphConfig) -> Self {
        self.graph = graph;
        self
    }

    pub fn with_arena(mut self, arena: ArenaConfig) -> Self {
        self.arena = arena;
        self
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = Some(logging);
        self
    }

    pub fn from_json(json: &str) -> SessionResult<Self> {
        let config: SessionConfig =
            serde_json::from_str(json).map_err(|e| SessionError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> SessionResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn check(&self) -> SessionResult<()> {
        self.graph.check()?;
        self.arena.check().map_err(SessionError::Config)
    }
}

/// Outcome of [`Session::compile`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileReport {
    pub optimize: OptimizeStats,
    pub memory: MemoryPlan,
    pub arena_peak_bytes: usize,
    pub operators: usize,
    pub tensors: usize,
}

/// Owns a graph together with the arena its tensors are bound to.
#[derive(Debug)]
pub struct Session {
    graph: Graph,
    arena: ArenaAllocator,
    config: SessionConfig,
    report: Option<CompileReport>,
}

impl Session {
    pub fn new(runtime: RuntimeHandle, config: SessionConfig) -> SessionResult<Self> {
        config.check()?;
        Ok(Self {
            graph: Graph::with_config(runtime, config.graph.clone()),
            arena: ArenaAllocator::new(config.arena.clone()),
            config,
            report: None,
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Mutable access for building the graph. Any change invalidates a
    /// previous compile.
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn arena(&self) -> &ArenaAllocator {
        &self.arena
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }

    /// Installs the configured global subscriber, if any.
    pub fn install_logging(&self) -> SessionResult<()> {
        match &self.config.logging {
            Some(logging) => init_logging(logging),
            None => Ok(()),
        }
    }

    /// Runs sort, optimize, shape inference and memory binding.
    ///
    /// Compiling an unchanged graph again returns the previous report.
    pub fn compile(&mut self) -> SessionResult<CompileReport> {
        if self.graph.phase() == GraphPhase::Allocated {
            if let Some(report) = &self.report {
                return Ok(report.clone());
            }
        }

        let span = info_span!(
            "compile",
            operators = self.graph.num_operators(),
            tensors = self.graph.num_tensors()
        );
        let _enter = span.enter();

        self.graph.topo_sort()?;
        let optimize = if self.config.graph.optimize.fixpoint {
            self.graph.optimize_to_fixpoint()?
        } else {
            self.graph.optimize()?
        };
        self.graph.shape_infer()?;

        if self.arena.is_materialized() {
            self.arena.reset();
        }
        let memory = self.graph.data_malloc(&mut self.arena)?.clone();

        let report = CompileReport {
            optimize,
            memory,
            arena_peak_bytes: self.arena.peak_bytes(),
            operators: self.graph.num_operators(),
            tensors: self.graph.num_tensors(),
        };
        info!(
            operators = report.operators,
            tensors = report.tensors,
            ops_removed = report.optimize.ops_removed,
            arena_peak_bytes = report.arena_peak_bytes,
            "compile finished"
        );
        self.report = Some(report.clone());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opgraph_ir::{CpuRuntime, DataType, OptimizeConfig, UnaryOp};

    #[test]
    fn test_config_json() {
        let config = SessionConfig::from_json(
            r#"{"graph": {"optimize": {"fixpoint": true}}, "arena": {"alignment": 4}}"#,
        )
        .unwrap();
        assert!(config.graph.optimize.fixpoint);
        assert_eq!(config.graph.optimize.max_rounds, OptimizeConfig::default().max_rounds);
        assert_eq!(config.arena.alignment, 4);
        assert!(config.logging.is_none());
    }

    #[test]
    fn test_config_rejects_bad_alignment() {
        let err = SessionConfig::from_json(r#"{"arena": {"alignment": 3}}"#).unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[test]
    fn test_config_rejects_zero_rounds() {
        let err =
            SessionConfig::from_json(r#"{"graph": {"optimize": {"fixpoint": true, "max_rounds": 0}}}"#)
                .unwrap_err();
        assert!(matches!(err, SessionError::Graph(_)));
    }

    #[test]
    fn test_missing_config_file() {
        let err = SessionConfig::load("/nonexistent/opgraph-session.json").unwrap_err();
        assert!(matches!(err, SessionError::Io(_)));
    }

    #[test]
    fn test_compile_is_cached_until_mutation() {
        let mut session = Session::new(CpuRuntime::handle(), SessionConfig::default()).unwrap();
        let g = session.graph_mut();
        let x = g.add_tensor(vec![4, 4], DataType::Float32);
        let r = g.add_unary(UnaryOp::Relu, x).unwrap();

        let first = session.compile().unwrap();
        assert_eq!(first.memory.total_bytes, 128);
        assert_eq!(session.compile().unwrap(), first);

        let y = session.graph().output_of(r).unwrap();
        session.graph_mut().add_unary(UnaryOp::Exp, y).unwrap();
        let second = session.compile().unwrap();
        assert_eq!(second.tensors, 3);
        assert_eq!(second.memory.total_bytes, 192);
    }
}
