//! Writes the sonar OpenAPI document.
//!
//! ```bash
//! cargo run --bin gen-openapi -p sonar-server            # -> <workspace>/openapi.json
//! cargo run --bin gen-openapi -p sonar-server -- out.json
//! ```

use std::path::PathBuf;

use anyhow::Context;
use sonar_server::api::openapi::ApiDoc;
use utoipa::OpenApi;

fn output_path() -> anyhow::Result<PathBuf> {
    if let Some(path) = std::env::args_os().nth(1) {
        return Ok(PathBuf::from(path));
    }
    let workspace_root = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map(PathBuf::from)
        .context("sonar-server is not inside a workspace")?;
    Ok(workspace_root.join("openapi.json"))
}

fn main() -> anyhow::Result<()> {
    let doc = ApiDoc::openapi();
    let json = doc.to_pretty_json()?;
    let path = output_path()?;
    std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;

    let schemas = doc.components.as_ref().map_or(0, |c| c.schemas.len());
    println!("{} ({} paths, {schemas} schemas)", path.display(), doc.paths.paths.len());
    for (route, _) in &doc.paths.paths {
        println!("  {route}");
    }
    Ok(())
}
