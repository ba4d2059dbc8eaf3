//! Browser sidecar: Docker lifecycle for the Flask + Playwright bridge.
//!
//! The sidecar runs the stock Playwright Python image; the bridge script is
//! injected at container start (base64-encoded into the command line, which
//! sidesteps multi-line quoting) rather than baked into a custom image.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use super::bridge::BridgeClient;
use super::EngineError;

/// Default Docker image for the browser sidecar.
pub const BROWSER_IMAGE: &str = "mcr.microsoft.com/playwright/python:v1.49.0";

/// Default container name for the browser sidecar.
pub const CONTAINER_NAME: &str = "simstim-browser";

/// Memory limit for the browser container (2 GB).
const MEMORY_LIMIT_BYTES: i64 = 2 * 1024 * 1024 * 1024;

/// CFS scheduling period in microseconds.
const CPU_PERIOD: i64 = 100_000;

/// CFS quota in microseconds (200_000 / 100_000 = 2 cores).
const CPU_QUOTA: i64 = 200_000;

/// Python bridge server script embedded as a constant.
///
/// One Flask process serves many isolated browser contexts, addressed by
/// caller-chosen identifiers. Every route answers the same envelope the
/// Rust client expects: `{"success": bool, "data": ..., "error": ...}`.
pub const BRIDGE_SCRIPT: &str = r#"import base64, os
from flask import Flask, request, jsonify
from playwright.sync_api import sync_playwright

app = Flask(__name__)
pw = None
browser = None
contexts = {}

HEADLESS = os.environ.get("HEADLESS", "1") != "0"

def get_browser():
    global pw, browser
    if browser is None:
        pw = sync_playwright().start()
        browser = pw.chromium.launch(headless=HEADLESS, args=["--no-sandbox", "--disable-gpu"])
    return browser

def ok(data=None):
    return jsonify({"success": True, "data": data})

def fail(message):
    return jsonify({"success": False, "error": message})

def lookup(context_id):
    entry = contexts.get(context_id)
    if entry is None:
        raise KeyError(f"unknown context {context_id}")
    return entry

@app.route("/health")
def health():
    return ok({"status": "ok", "contexts": len(contexts)})

@app.route("/contexts", methods=["POST"])
def create_context():
    try:
        spec = request.get_json(force=True)
        context_id = spec["context_id"]
        if context_id in contexts:
            return fail(f"context {context_id} already exists")
        ctx = get_browser().new_context(
            viewport={"width": spec.get("width", 1280), "height": spec.get("height", 720)},
            user_agent=spec.get("user_agent"),
            locale=spec.get("locale"),
            timezone_id=spec.get("timezone"),
        )
        page = ctx.new_page()
        contexts[context_id] = (ctx, page)
        return ok({"context_id": context_id})
    except Exception as e:
        return fail(f"{type(e).__name__}: {e}")

@app.route("/contexts/<context_id>/goto", methods=["POST"])
def goto(context_id):
    try:
        _, page = lookup(context_id)
        data = request.get_json(force=True)
        page.goto(data["url"], wait_until="domcontentloaded", timeout=data.get("timeout_ms", 30000))
        return ok({"url": page.url, "title": page.title()})
    except Exception as e:
        return fail(f"{type(e).__name__}: {e}")

@app.route("/contexts/<context_id>/click", methods=["POST"])
def click(context_id):
    try:
        _, page = lookup(context_id)
        data = request.get_json(force=True)
        page.click(data["selector"], timeout=data.get("timeout_ms", 5000))
        return ok({"clicked": data["selector"]})
    except Exception as e:
        return fail(f"{type(e).__name__}: {e}")

@app.route("/contexts/<context_id>/screenshot", methods=["POST"])
def screenshot(context_id):
    try:
        _, page = lookup(context_id)
        data = request.get_json(force=True) or {}
        sel = data.get("selector")
        if sel:
            el = page.query_selector(sel)
            if el is None:
                return fail(f"no element matches {sel}")
            raw = el.screenshot(type="png")
        else:
            raw = page.screenshot(type="png")
        return ok(base64.b64encode(raw).decode("ascii"))
    except Exception as e:
        return fail(f"{type(e).__name__}: {e}")

@app.route("/contexts/<context_id>/evaluate", methods=["POST"])
def evaluate(context_id):
    try:
        _, page = lookup(context_id)
        data = request.get_json(force=True)
        return ok(page.evaluate(data.get("javascript", "")))
    except Exception as e:
        return fail(f"{type(e).__name__}: {e}")

@app.route("/contexts/<context_id>/url")
def current_url(context_id):
    try:
        _, page = lookup(context_id)
        return ok(page.url)
    except Exception as e:
        return fail(f"{type(e).__name__}: {e}")

@app.route("/contexts/<context_id>/cookies")
def cookies(context_id):
    try:
        ctx, _ = lookup(context_id)
        return ok(ctx.cookies())
    except Exception as e:
        return fail(f"{type(e).__name__}: {e}")

@app.route("/contexts/<context_id>", methods=["DELETE"])
def close_context(context_id):
    try:
        ctx, page = contexts.pop(context_id, (None, None))
        if ctx is None:
            return ok({"closed": False})
        try: page.close()
        except Exception: pass
        try: ctx.close()
        except Exception: pass
        return ok({"closed": True})
    except Exception as e:
        return fail(f"{type(e).__name__}: {e}")

if __name__ == "__main__":
    port = int(os.environ.get("BRIDGE_PORT", "9224"))
    app.run(host="0.0.0.0", port=port, threaded=False)
"#;

/// How the sidecar container should look, derived from configuration.
#[derive(Debug, Clone)]
pub struct SidecarSpec {
    /// Docker image to run.
    pub image: String,
    /// Container name.
    pub container_name: String,
    /// Host port the bridge is published on (localhost only).
    pub port: u16,
    /// Whether Chromium runs headless inside the container.
    pub headless: bool,
}

impl Default for SidecarSpec {
    fn default() -> Self {
        Self {
            image: BROWSER_IMAGE.to_owned(),
            container_name: CONTAINER_NAME.to_owned(),
            port: super::bridge::DEFAULT_BRIDGE_PORT,
            headless: true,
        }
    }
}

/// Startup command: install Flask, materialize the bridge script, run it.
fn container_command() -> Vec<String> {
    let script_b64 = BASE64.encode(BRIDGE_SCRIPT);
    vec![
        "bash".to_owned(),
        "-lc".to_owned(),
        format!(
            "pip install --no-cache-dir --quiet flask==3.1.* && \
             echo \"{script_b64}\" | base64 -d > /opt/simstim_bridge.py && \
             python3 /opt/simstim_bridge.py"
        ),
    ]
}

/// Browser sidecar providing HTTP-based browser automation.
pub struct BrowserSidecar {
    base_url: String,
}

impl BrowserSidecar {
    /// Ensure the sidecar container is running and its bridge is healthy.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Driver`] if any Docker operation fails or the
    /// bridge does not become healthy within the retry budget.
    pub async fn ensure(docker: &Docker, spec: &SidecarSpec) -> Result<Self, EngineError> {
        ensure_container(docker, spec).await?;

        let client = BridgeClient::with_port(spec.port);
        client.wait_healthy().await?;

        Ok(Self {
            base_url: client.base_url().to_owned(),
        })
    }

    /// Remove the sidecar container.
    ///
    /// Silently ignores removal errors (e.g. container already removed).
    pub async fn teardown(docker: &Docker, container_name: &str) {
        let remove_opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        let _ = docker.remove_container(container_name, Some(remove_opts)).await;
    }

    /// Base URL for the bridge HTTP API (e.g. `http://127.0.0.1:9224`).
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Ensure the sidecar container exists and is running.
///
/// Inspects the container; if it exists and is running with matching
/// configuration, returns immediately. If it exists but is stopped, starts
/// it. If it does not exist, pulls the image, creates and starts it.
/// Recreates when the published port or headless setting has changed.
async fn ensure_container(docker: &Docker, spec: &SidecarSpec) -> Result<(), EngineError> {
    let inspect = docker
        .inspect_container(&spec.container_name, None::<InspectContainerOptions>)
        .await;

    let needs_start = match inspect {
        Ok(state) => {
            let port_matches = state
                .host_config
                .as_ref()
                .and_then(|hc| hc.port_bindings.as_ref())
                .and_then(|pb| pb.get(&format!("{}/tcp", spec.port)))
                .is_some();

            let headless_env = format!("HEADLESS={}", u8::from(spec.headless));
            let env_matches = state
                .config
                .as_ref()
                .and_then(|c| c.env.as_ref())
                .is_some_and(|vars| vars.iter().any(|v| v == &headless_env));

            if !port_matches || !env_matches {
                info!(
                    container = spec.container_name,
                    "browser sidecar config mismatch, recreating container"
                );
                let remove_opts = RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                };
                let _ = docker
                    .remove_container(&spec.container_name, Some(remove_opts))
                    .await;
                pull_image(docker, &spec.image).await;
                create_container(docker, spec).await?;
                true
            } else {
                let running = state.state.and_then(|s| s.running).unwrap_or(false);
                !running
            }
        }
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => {
            pull_image(docker, &spec.image).await;
            create_container(docker, spec).await?;
            true
        }
        Err(e) => {
            return Err(EngineError::Driver(format!(
                "failed to inspect browser sidecar: {e}"
            )));
        }
    };

    if needs_start {
        docker
            .start_container(&spec.container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| EngineError::Driver(format!("failed to start browser sidecar: {e}")))?;
        info!(container = spec.container_name, "browser sidecar started");
    }

    Ok(())
}

/// Pull the sidecar image, tolerating failures for locally cached images.
async fn pull_image(docker: &Docker, image: &str) {
    let pull_opts = CreateImageOptions {
        from_image: image,
        ..Default::default()
    };
    let mut pull_stream = docker.create_image(Some(pull_opts), None, None);
    while let Some(result) = pull_stream.next().await {
        if let Err(e) = result {
            warn!(error = %e, "image pull warning");
        }
    }
    info!(image, "browser sidecar image ready");
}

/// Create the sidecar container with resource limits and port mapping.
async fn create_container(docker: &Docker, spec: &SidecarSpec) -> Result<(), EngineError> {
    let mut labels = HashMap::new();
    labels.insert("simstim".to_owned(), "true".to_owned());

    let port_key = format!("{}/tcp", spec.port);
    let mut port_bindings = HashMap::new();
    port_bindings.insert(
        port_key.clone(),
        Some(vec![PortBinding {
            host_ip: Some("127.0.0.1".to_owned()),
            host_port: Some(spec.port.to_string()),
        }]),
    );

    let host_config = HostConfig {
        port_bindings: Some(port_bindings),
        memory: Some(MEMORY_LIMIT_BYTES),
        cpu_period: Some(CPU_PERIOD),
        cpu_quota: Some(CPU_QUOTA),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::ON_FAILURE),
            maximum_retry_count: Some(5),
        }),
        // Chromium inside Docker needs /dev/shm to be large enough.
        shm_size: Some(512 * 1024 * 1024),
        ..Default::default()
    };

    let mut exposed_ports = HashMap::new();
    exposed_ports.insert(port_key, HashMap::new());

    // Only the bridge port and headless toggle cross into the container.
    // No credentials or host configuration leak into the sidecar.
    let env_vars = vec![
        format!("BRIDGE_PORT={}", spec.port),
        format!("HEADLESS={}", u8::from(spec.headless)),
    ];

    let container_config = ContainerConfig {
        image: Some(spec.image.clone()),
        labels: Some(labels),
        exposed_ports: Some(exposed_ports),
        env: Some(env_vars),
        cmd: Some(container_command()),
        host_config: Some(host_config),
        ..Default::default()
    };

    let options = Some(CreateContainerOptions {
        name: spec.container_name.clone(),
        platform: None,
    });

    docker
        .create_container(options, container_config)
        .await
        .map_err(|e| EngineError::Driver(format!("failed to create browser sidecar: {e}")))?;

    Ok(())
}
