use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use inkread::config::Settings;
use inkread::model::{ModelSession, Transcriber};
use inkread::server::{self, UploadLimit};
use inkread::util::init_tracing;
use std::env;
use std::sync::Arc;
use tracing::info;

const USAGE: &str = "usage: ./inkread [config file]";

fn get_args() -> anyhow::Result<Option<String>> {
    let mut args = env::args().skip(1);
    let path = args.next();
    if args.next().is_some() {
        anyhow::bail!("{USAGE}");
    }
    Ok(path)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load(get_args()?.as_deref())?;
    init_tracing(&settings.log);

    // The model is loaded before binding, so a broken model never serves
    let session = ModelSession::from_settings(&settings.model)
        .await
        .with_context(|| format!("failed to load model {}", settings.model.name))?;
    info!("model session ready: {session:?}");

    let transcriber: Arc<dyn Transcriber> = Arc::new(session);
    let transcriber = web::Data::from(transcriber);
    let limit = web::Data::new(UploadLimit(settings.server.max_upload_bytes));

    let addr = settings.bind_addr();
    info!("listening on {addr}");

    // Start the HTTP server
    let mut http = HttpServer::new(move || {
        App::new()
            .app_data(transcriber.clone())
            .app_data(limit.clone())
            .wrap(middleware::Logger::default())
            .configure(server::configure)
    });
    if let Some(workers) = settings.server.workers {
        http = http.workers(workers);
    }

    http.bind(&addr)?.run().await?;
    Ok(())
}
