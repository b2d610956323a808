use anyhow::Context;
use control_plane::openapi::ApiDoc;
use utoipa::OpenApi;

/// Prints the OpenAPI document, or writes it to the path given as the first argument.
fn main() -> anyhow::Result<()> {
    let json = ApiDoc::openapi()
        .to_pretty_json()
        .context("serialize openapi document to json")?;
    match std::env::args().nth(1) {
        Some(path) => std::fs::write(&path, format!("{json}\n"))
            .with_context(|| format!("write openapi document to {path}"))?,
        None => println!("{json}"),
    }
    Ok(())
}
