//! Decode the published surface of a live process.

use anyhow::{Context, Result, bail};
use labelscope_core::{ContextId, Label};
use labelscope_runtime::{CurrentView, MemorySource, SurfaceReader};
use serde::Serialize;

/// Where the surface starts in the target's address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Entry {
    /// Address of the surface header.
    Header(u64),
    /// Address of the exported anchor symbol.
    Anchor(u64),
}

/// What a single inspection found.
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Inspection {
    /// Labels of one requested context.
    Context { context: ContextId, labels: Vec<Label> },
    /// The running context plus every published context id.
    Overview {
        header: u64,
        live: u64,
        current: CurrentView,
        contexts: Vec<ContextId>,
    },
}

/// Attach to `mem` at `entry` and read either one context or an overview.
pub fn inspect<M: MemorySource>(mem: M, entry: Entry, context: Option<u64>) -> Result<Inspection> {
    let reader = match entry {
        Entry::Header(addr) => SurfaceReader::attach(mem, addr),
        Entry::Anchor(addr) => SurfaceReader::from_anchor(mem, addr),
    }
    .context("Failed to attach to label surface")?;

    if let Some(raw) = context {
        let Some(ctx) = ContextId::new(raw) else {
            bail!("context id {raw} is reserved");
        };
        let labels = reader
            .labels_for(ctx)
            .with_context(|| format!("Failed to read labels of {ctx}"))?;
        return Ok(Inspection::Context {
            context: ctx,
            labels,
        });
    }

    let current = reader.current().context("Failed to read current labels")?;
    let contexts = reader
        .contexts()
        .context("Failed to list contexts")?
        .into_iter()
        .map(|(ctx, _)| ctx)
        .collect();
    Ok(Inspection::Overview {
        header: reader.header_addr(),
        live: reader.header().live,
        current,
        contexts,
    })
}

/// Accepts `0x`-prefixed hex or decimal.
pub fn parse_addr(raw: &str) -> std::result::Result<u64, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|err| format!("invalid address {raw:?}: {err}"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_addr_accepts_hex_and_decimal() {
        assert_eq!(parse_addr("0x7f00").unwrap(), 0x7f00);
        assert_eq!(parse_addr("0X10").unwrap(), 16);
        assert_eq!(parse_addr("4096").unwrap(), 4096);
        assert!(parse_addr("0xzz").is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn inspects_own_registry() {
        use assert_matches::assert_matches;
        use labelscope_runtime::{ContextHooks, HostCapabilities, ProcMemory, Registry, RegistryConfig};

        let reg = Registry::new(RegistryConfig::default());
        assert!(reg.bind_host(HostCapabilities::full()));
        let ctx = reg.next_context_id();
        reg.on_create_with(ctx, ContextId::ROOT, [("tenant", "acme")]);

        let found = inspect(
            ProcMemory::current().unwrap(),
            Entry::Header(reg.header_addr()),
            Some(ctx.get()),
        )
        .unwrap();
        assert_matches!(found, Inspection::Context { labels, .. } if labels.len() == 1);

        let overview = inspect(ProcMemory::current().unwrap(), Entry::Header(reg.header_addr()), None).unwrap();
        assert_matches!(
            overview,
            Inspection::Overview { live: 2, contexts, .. } if contexts.contains(&ctx)
        );
    }
}
