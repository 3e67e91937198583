use crate::generator::profile::GeneratorConfig;
use crate::gui_bridge::model::SpectrumModel;
use crate::workflow::runner::Runner;
use anyhow::{anyhow, Context, Result};
use log::{error, info};
use serde_json::json;
use std::{
    net::SocketAddr,
    sync::{mpsc, Arc, RwLock},
    thread,
};
use tokio::runtime::Builder;
use warp::{http::StatusCode, Filter};

pub fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9000))
}

type SharedModel = Arc<RwLock<SpectrumModel>>;

fn read_model(state: &SharedModel) -> SpectrumModel {
    match state.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn write_model(state: &SharedModel, model: SpectrumModel) {
    match state.write() {
        Ok(mut guard) => *guard = model,
        Err(poisoned) => *poisoned.into_inner() = model,
    }
}

/// `GET /spectrum` and `POST /ingest-config`.
pub fn routes(
    state: SharedModel,
    runner: Arc<Runner>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let state_filter = warp::any().map(move || state.clone());
    let runner_filter = warp::any().map(move || runner.clone());

    let get_route = warp::path("spectrum")
        .and(warp::get())
        .and(state_filter.clone())
        .map(|state: SharedModel| warp::reply::json(&read_model(&state)));

    let generator_route = warp::path("ingest-config")
        .and(warp::post())
        .and(warp::body::json())
        .and(state_filter)
        .and(runner_filter)
        .and_then(
            |config: GeneratorConfig, state: SharedModel, runner: Arc<Runner>| async move {
                let reply = match runner.execute(&config) {
                    Ok(result) => {
                        let model = SpectrumModel::from_result(&result, config.scenario.clone());
                        if let Some(name) = config.scenario.as_ref() {
                            info!(
                                "[GUI] Scenario {} -> {} outliers replaced",
                                name, model.outliers_replaced
                            );
                        }
                        let body = json!({
                            "status": "ok",
                            "integrations": model.flux.len(),
                            "outliers_replaced": model.outliers_replaced,
                            "description": config.description.clone().unwrap_or_default()
                        });
                        write_model(&state, model);
                        warp::reply::with_status(warp::reply::json(&body), StatusCode::OK)
                    }
                    Err(err) => {
                        error!("ingest-config error: {:#}", err);
                        warp::reply::with_status(
                            warp::reply::json(&json!({
                                "status": "error",
                                "message": format!("{:#}", err)
                            })),
                            StatusCode::UNPROCESSABLE_ENTITY,
                        )
                    }
                };
                Ok::<_, warp::Rejection>(reply)
            },
        );

    get_route.or(generator_route)
}

/// Bridge that hosts the spectrum HTTP endpoint and runs posted scenarios.
pub struct GuiBridge {
    state: SharedModel,
    address: SocketAddr,
}

impl GuiBridge {
    /// Starts the HTTP server on its own thread. Port 0 binds an ephemeral
    /// port; [`GuiBridge::address`] reports the bound one.
    pub fn new(runner: Arc<Runner>, bind: SocketAddr) -> Result<Self> {
        let state: SharedModel = Arc::new(RwLock::new(SpectrumModel::default()));
        let filter = routes(state.clone(), runner);
        let (bound_tx, bound_rx) = mpsc::channel();

        thread::spawn(move || {
            let runtime = match Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(err) => {
                    let _ = bound_tx.send(Err(anyhow!("building bridge runtime: {}", err)));
                    return;
                }
            };
            runtime.block_on(async move {
                match warp::serve(filter).try_bind_ephemeral(bind) {
                    Ok((address, server)) => {
                        let _ = bound_tx.send(Ok(address));
                        server.await;
                    }
                    Err(err) => {
                        let _ = bound_tx.send(Err(anyhow!("binding {}: {}", bind, err)));
                    }
                }
            });
        });

        let address = bound_rx
            .recv()
            .context("bridge thread exited before binding")??;
        info!("[GUI] bridge listening on http://{}", address);
        Ok(Self { state, address })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn publish(&self, model: SpectrumModel) {
        info!(
            "[GUI] spectra: {} integrations x {} rows, outliers replaced: {}",
            model.flux.len(),
            model.wavelengths.len(),
            model.outliers_replaced
        );
        write_model(&self.state, model);
    }

    pub fn publish_status(&self, message: &str) {
        info!("[GUI] {}", message);
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> SpectrumModel {
        read_model(&self.state)
    }
}
