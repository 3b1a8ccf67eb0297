//! Driver used by the `maptree` binary: load a node list, run a script of
//! intents, and render the result.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{EngineMode, MapTreeConfig};
use crate::engine::{load_script, EngineHandle, InMemoryRepository, Intent, TreeEngine};
use crate::error::Result;
use crate::tree::{decode_json, encode, Node};

/// What to load and how to print it.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub input: PathBuf,
    pub script: Option<PathBuf>,
    pub json: bool,
}

/// Outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub applied: usize,
    pub failed: usize,
    pub output: String,
}

/// Load the input, apply the script and render the final tree.
///
/// Failed intents are logged and skipped; only load errors abort the run.
pub async fn run(options: &RunOptions, config: &MapTreeConfig) -> Result<RunReport> {
    let text = std::fs::read_to_string(&options.input)?;
    let decoded = decode_json(&text, config.orphans())?;
    tracing::info!(
        nodes = decoded.forest.len(),
        roots = decoded.forest.roots.len(),
        orphans = decoded.warnings.len(),
        "tree loaded from {}",
        options.input.display()
    );

    let intents = match &options.script {
        Some(path) => load_script(path)?,
        None => Vec::new(),
    };
    let engine = TreeEngine::new(decoded.forest).with_policy(config.rollback());

    let (applied, failed, output) = match config.mode() {
        EngineMode::Sync => {
            let mut engine = engine;
            let mut applied = 0;
            for (step, intent) in intents.iter().enumerate() {
                match intent.apply_local(&mut engine) {
                    Ok(outcome) => {
                        applied += 1;
                        tracing::info!(step, "{}", outcome);
                    }
                    Err(e) => log_failure(step, intent, &e),
                }
            }
            (applied, intents.len() - applied, render(&engine, options.json)?)
        }
        EngineMode::Async => {
            let repo = InMemoryRepository::new(config.first_id()).with_latency(config.latency());
            let handle = EngineHandle::new(engine, Arc::new(repo));
            let mut applied = 0;
            for (step, intent) in intents.iter().enumerate() {
                match handle.dispatch(intent).await {
                    Ok(outcome) => {
                        applied += 1;
                        tracing::info!(step, "{}", outcome);
                    }
                    Err(e) => log_failure(step, intent, &e),
                }
            }
            handle.close();
            let engine = handle.engine().await;
            (applied, intents.len() - applied, render(&engine, options.json)?)
        }
    };

    Ok(RunReport {
        applied,
        failed,
        output,
    })
}

fn log_failure(step: usize, intent: &Intent, error: &crate::error::MapTreeError) {
    tracing::warn!(step, op = intent.name(), error = %error, "intent failed");
}

fn render(engine: &TreeEngine, json: bool) -> Result<String> {
    if json {
        Ok(serde_json::to_string_pretty(&encode(engine.forest()))?)
    } else {
        Ok(render_outline(engine))
    }
}

/// Indented outline: `[x]` visible, `+` group, `-` leaf, `*` selected, `?` unconfirmed.
pub fn render_outline(engine: &TreeEngine) -> String {
    fn walk(engine: &TreeEngine, node: &Node, depth: usize, out: &mut String) {
        let visible = engine
            .mirror()
            .find_by_key(&node.id)
            .map(|l| l.visible())
            .unwrap_or(false);
        let _ = write!(
            out,
            "{}[{}] {} {} ({})",
            "  ".repeat(depth),
            if visible { 'x' } else { ' ' },
            if node.is_leaf() { '-' } else { '+' },
            node.title,
            node.id
        );
        if engine.selection().is_selected(&node.id) {
            out.push_str(" *");
        }
        if engine.is_unconfirmed(&node.id) {
            out.push_str(" ?");
        }
        out.push('\n');
        for child in &node.children {
            walk(engine, child, depth + 1, out);
        }
    }

    let mut out = String::new();
    for root in &engine.forest().roots {
        walk(engine, root, 0, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, RepositoryConfig};
    use crate::tree::node::tests::sample_forest;
    use crate::tree::NodeId;

    const INPUT: &str = r#"{ "data": [
        { "id": 1, "attributes": { "title": "Base maps", "left": 1, "right": 6, "tree_id": 1, "level": 0, "is_leaf": false },
          "relationships": { "parent": { "data": null } } },
        { "id": 2, "attributes": { "title": "Streets", "left": 2, "right": 3, "tree_id": 1, "level": 1, "is_leaf": true },
          "relationships": { "parent": { "data": { "id": 1 } } } },
        { "id": 3, "attributes": { "title": "Rivers", "left": 4, "right": 5, "tree_id": 1, "level": 1, "is_leaf": true },
          "relationships": { "parent": { "data": { "id": 1 } } } }
    ] }"#;

    const SCRIPT: &str = r#"[
        { "op": "add", "parent": 1, "attributes": { "title": "Parcels" } },
        { "op": "move", "drag": 3, "target": 2, "place": "before" },
        { "op": "remove", "id": "missing" },
        { "op": "check", "id": 2, "checked": false }
    ]"#;

    fn write_inputs() -> (tempfile::TempDir, RunOptions) {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("tree.json");
        let script = dir.path().join("script.json");
        std::fs::write(&input, INPUT).expect("write input");
        std::fs::write(&script, SCRIPT).expect("write script");
        let options = RunOptions {
            input,
            script: Some(script),
            json: false,
        };
        (dir, options)
    }

    fn config(mode: EngineMode) -> MapTreeConfig {
        MapTreeConfig {
            engine: EngineConfig {
                mode: Some(mode),
                ..Default::default()
            },
            repository: RepositoryConfig {
                first_id: Some(50),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn outline_marks_visibility_and_selection() {
        let mut engine = TreeEngine::new(sample_forest());
        engine.check(&"B".into(), false).unwrap();
        engine.select(&[NodeId::from("D")]);
        assert_eq!(
            render_outline(&engine),
            "[x] + Base maps (A)\n  [ ] - Streets (B)\n  [x] + Overlays (C)\n    [x] - Rivers (D) *\n[x] + Empty (E)\n"
        );
    }

    #[tokio::test]
    async fn async_run_confirms_ids_and_skips_failures() {
        let (_dir, options) = write_inputs();
        let report = run(&options, &config(EngineMode::Async)).await.unwrap();
        assert_eq!(report.applied, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(
            report.output,
            "[x] + Base maps (1)\n  [x] - Rivers (3)\n  [ ] - Streets (2)\n  [x] - Parcels (50)\n"
        );
    }

    #[tokio::test]
    async fn sync_run_keeps_provisional_ids() {
        let (_dir, options) = write_inputs();
        let report = run(&options, &config(EngineMode::Sync)).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(report.output.contains("Parcels (1-2)"));
    }

    #[tokio::test]
    async fn json_output_is_decodable() {
        let (_dir, mut options) = write_inputs();
        options.json = true;
        options.script = None;
        let report = run(&options, &config(EngineMode::Sync)).await.unwrap();
        let decoded = decode_json(&report.output, Default::default()).unwrap();
        assert_eq!(decoded.forest.len(), 3);
        assert!(decoded.warnings.is_empty());
    }

    #[tokio::test]
    async fn missing_input_is_io_error() {
        let options = RunOptions {
            input: PathBuf::from("/nonexistent/tree.json"),
            ..Default::default()
        };
        let err = run(&options, &MapTreeConfig::default()).await.unwrap_err();
        assert!(matches!(err, crate::error::MapTreeError::Io(_)));
    }
}
