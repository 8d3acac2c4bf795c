use nbexec_shared::ExecutionResult;
use rocket::{figment::Figment, serde::json::Json, Build, Rocket, State};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{config::ServiceConfig, state::AppState};

#[macro_use]
extern crate rocket;

mod config;
mod state;

const BANNER: &str = "Notebook Execution Restful API version 1.0.0";

#[derive(Serialize, Debug)]
struct Version {
    version: &'static str,
    package: &'static str,
}

#[get("/")]
fn index() -> &'static str {
    BANNER
}

#[get("/version")]
fn version() -> Json<Version> {
    Json(Version {
        version: "v1",
        package: env!("CARGO_PKG_VERSION"),
    })
}

/// the job outcome travels in the body, the transport status is always 200
#[post("/execute/<job_id>")]
async fn execute(state: &State<AppState>, job_id: &str) -> Json<ExecutionResult> {
    info!("execute request for job {}", job_id);
    Json(state.dispatcher.execute(job_id).await)
}

fn build(state: AppState, figment: Figment) -> Rocket<Build> {
    rocket::custom(figment)
        .manage(state)
        .mount("/", routes![index])
        .mount("/nb/v1", routes![version, execute])
}

#[rocket::main]
async fn main() -> Result<(), rocket::Error> {
    dotenvy::dotenv().ok();
    let config = ServiceConfig::from_env().expect("invalid configuration");

    let default_filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(fmt::layer())
        .init();

    let state = AppState::from_config(&config)
        .await
        .expect("failed to prepare the content store");
    info!(
        "serving on {}:{} with {} workers, workspaces under {:?}",
        config.address, config.port, config.workers, config.exe_dir
    );

    let figment = rocket::Config::figment()
        .merge(("address", config.address))
        .merge(("port", config.port));
    let _ = build(state, figment).launch().await?;
    Ok(())
}
