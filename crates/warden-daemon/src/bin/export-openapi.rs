//! Prints the OpenAPI document for the daemon's HTTP surface.

use utoipa::OpenApi;

use warden_daemon::server::docs::ApiDoc;

fn main() -> anyhow::Result<()> {
    println!("{}", ApiDoc::openapi().to_pretty_json()?);
    Ok(())
}
