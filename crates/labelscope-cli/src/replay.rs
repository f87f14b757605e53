//! Replay a JSON-lines scheduler trace against a fresh registry.
//!
//! Each line is one [`Op`]:
//!
//! ```text
//! {"op":"create","child":2,"trigger":1,"labels":[["tenant","acme"]]}
//! {"op":"before","ctx":2}
//! {"op":"with","labels":[["stage","parse"],["tenant",null]],"then":[{"op":"print"}]}
//! {"op":"after","ctx":2}
//! {"op":"destroy","ctx":2}
//! ```
//!
//! A `null` label value deletes the key for the scope.

use std::io::BufRead;

use anyhow::{Context, Result, anyhow};
use labelscope_core::{ContextId, LabelSet, LabelValue, Override};
use labelscope_runtime::{ContextHooks, ContextSnapshot, Registry, RegistryStats};
use serde::{Deserialize, Serialize};

/// One scheduler event or scoped action.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// `child` is created by `trigger`, optionally with labels of its own.
    Create {
        child: u64,
        trigger: u64,
        #[serde(default)]
        labels: Vec<(String, Option<LabelValue>)>,
    },
    /// `ctx` is about to run.
    Before { ctx: u64 },
    /// `ctx` stopped running.
    After { ctx: u64 },
    /// `ctx` is gone.
    Destroy { ctx: u64 },
    /// Run `then` with `labels` applied to the current context.
    With {
        labels: Vec<(String, Option<LabelValue>)>,
        #[serde(default)]
        then: Vec<Op>,
    },
    /// Record the current context and its labels.
    Print,
}

/// Labels observed by a `print` op.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Printed {
    pub context: ContextId,
    pub labels: LabelSet,
}

/// Final state after a replay.
#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub printed: Vec<Printed>,
    pub contexts: Vec<ContextSnapshot>,
    pub stats: RegistryStats,
}

/// Parse a trace, skipping blank lines.
pub fn parse_trace(reader: impl BufRead) -> Result<Vec<Op>> {
    let mut ops = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read trace line {}", index + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let op = serde_json::from_str(&line)
            .with_context(|| format!("Invalid op on trace line {}", index + 1))?;
        ops.push(op);
    }
    Ok(ops)
}

/// Feed `ops` into `registry` in order.
pub fn replay(registry: &Registry, ops: &[Op]) -> Result<ReplayReport> {
    let mut printed = Vec::new();
    run(registry, ops, &mut printed)?;
    Ok(ReplayReport {
        printed,
        contexts: registry.snapshot(),
        stats: registry.stats(),
    })
}

fn run(registry: &Registry, ops: &[Op], printed: &mut Vec<Printed>) -> Result<()> {
    for op in ops {
        match op {
            Op::Create {
                child,
                trigger,
                labels,
            } => {
                registry.on_create_with(context(*child)?, context(*trigger)?, overrides(labels));
            }
            Op::Before { ctx } => registry.on_before_run(context(*ctx)?),
            Op::After { ctx } => registry.on_after_run(context(*ctx)?),
            Op::Destroy { ctx } => registry.on_destroy(context(*ctx)?),
            Op::With { labels, then } => {
                registry.with_labels(overrides(labels), || run(registry, then, printed))??;
            }
            Op::Print => printed.push(Printed {
                context: registry.current_context(),
                labels: registry.cur_labels()?,
            }),
        }
    }
    Ok(())
}

fn context(raw: u64) -> Result<ContextId> {
    ContextId::new(raw).ok_or_else(|| anyhow!("context id {raw} is reserved"))
}

fn overrides(labels: &[(String, Option<LabelValue>)]) -> Vec<(String, Override)> {
    labels
        .iter()
        .map(|(key, value)| {
            let change = value.clone().map_or(Override::Delete, Override::from);
            (key.clone(), change)
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
