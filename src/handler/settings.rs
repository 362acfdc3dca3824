use std::str::FromStr;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::{
    handler::ApiJsonResult,
    params::{ParameterHandle, ParameterStore, ParameterUpdate, Parameters},
};

/// Marker clients append to a prompt to skip moderation.
const OVERRIDE_MARKER: &str = "-f";

#[derive(Clone)]
pub struct ControlState {
    pub handle: ParameterHandle,
    pub store: ParameterStore,
}

pub fn settings_router() -> Router<ControlState> {
    Router::new()
        .route("/", get(index))
        .route("/settings", get(current))
        .route("/prompt/{msg}", post(prompt))
        .route("/secondprompt/{msg}", post(second_prompt))
        .route("/blend/{value}", post(blend))
        .route("/tint", post(tint))
        .route(
            "/seed/{value}",
            get(|State(s): State<ControlState>, Path(v): Path<String>| {
                set_value(s, v, ParameterUpdate::Seed)
            }),
        )
        .route(
            "/steps/{value}",
            get(|State(s): State<ControlState>, Path(v): Path<String>| {
                set_value(s, v, ParameterUpdate::Steps)
            }),
        )
        .route(
            "/strength/{value}",
            get(|State(s): State<ControlState>, Path(v): Path<String>| {
                set_value(s, v, ParameterUpdate::Strength)
            }),
        )
        .route(
            "/opacity/{value}",
            get(|State(s): State<ControlState>, Path(v): Path<String>| {
                set_value(s, v, ParameterUpdate::Opacity)
            }),
        )
        .route(
            "/batch_size/{value}",
            get(|State(s): State<ControlState>, Path(v): Path<String>| {
                set_value(s, v, ParameterUpdate::BatchSize)
            }),
        )
        .route(
            "/passthrough/{status}",
            get(|State(s): State<ControlState>, Path(v): Path<String>| {
                set_flag(s, v, ParameterUpdate::Passthrough)
            }),
        )
        .route(
            "/fixed_seed/{status}",
            get(|State(s): State<ControlState>, Path(v): Path<String>| {
                set_flag(s, v, ParameterUpdate::FixedSeed)
            }),
        )
        .route(
            "/mirror/{status}",
            get(|State(s): State<ControlState>, Path(v): Path<String>| {
                set_flag(s, v, ParameterUpdate::Mirror)
            }),
        )
        .route(
            "/debug/{status}",
            get(|State(s): State<ControlState>, Path(v): Path<String>| {
                set_flag(s, v, ParameterUpdate::Debug)
            }),
        )
        .route(
            "/compel/{status}",
            get(|State(s): State<ControlState>, Path(v): Path<String>| {
                set_flag(s, v, ParameterUpdate::Compel)
            }),
        )
}

/// Tint fields left out keep their current value.
#[derive(Deserialize)]
struct TintRequest {
    color_1: Option<[u8; 3]>,
    color_2: Option<[u8; 3]>,
    strength: Option<f32>,
    interval_secs: Option<f32>,
}

#[derive(Serialize)]
struct Updated {
    status: &'static str,
}

#[derive(Serialize)]
struct PromptUpdated {
    status: &'static str,
    prompt: String,
}

#[derive(Serialize)]
struct BlendUpdated {
    status: &'static str,
    blend: f32,
    prompt: String,
}

async fn index() -> &'static str {
    "settings route!"
}

async fn current(State(state): State<ControlState>) -> Json<Parameters> {
    Json(Parameters::clone(&state.store.snapshot()))
}

async fn prompt(
    State(state): State<ControlState>,
    Path(msg): Path<String>,
) -> ApiJsonResult<PromptUpdated> {
    let snapshot = state
        .handle
        .apply(ParameterUpdate::Prompt(strip_override(&msg)))
        .await?;
    Ok(Json(PromptUpdated {
        status: "updated",
        prompt: snapshot.prompt.clone(),
    }))
}

async fn second_prompt(
    State(state): State<ControlState>,
    Path(msg): Path<String>,
) -> ApiJsonResult<PromptUpdated> {
    let snapshot = state
        .handle
        .apply(ParameterUpdate::SecondPrompt(strip_override(&msg)))
        .await?;
    Ok(Json(PromptUpdated {
        status: "updated",
        prompt: snapshot.prompt.clone(),
    }))
}

async fn blend(
    State(state): State<ControlState>,
    Path(value): Path<String>,
) -> ApiJsonResult<BlendUpdated> {
    let t: f32 = value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid blend value"))?;
    let snapshot = state.handle.apply(ParameterUpdate::Blend(t)).await?;
    Ok(Json(BlendUpdated {
        status: "success",
        blend: snapshot.blend,
        prompt: snapshot.prompt.clone(),
    }))
}

async fn tint(
    State(state): State<ControlState>,
    Json(req): Json<TintRequest>,
) -> ApiJsonResult<Parameters> {
    let current = state.store.snapshot();
    let snapshot = state
        .handle
        .apply(ParameterUpdate::Tint {
            color_1: req.color_1.unwrap_or(current.tint_color_1),
            color_2: req.color_2.unwrap_or(current.tint_color_2),
            strength: req.strength.unwrap_or(current.tint_strength),
            interval_secs: req.interval_secs.unwrap_or(current.tint_interval_secs),
        })
        .await?;
    Ok(Json(Parameters::clone(&snapshot)))
}

async fn set_value<T>(
    state: ControlState,
    raw: String,
    update: fn(T) -> ParameterUpdate,
) -> ApiJsonResult<Updated>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value = raw
        .trim()
        .parse::<T>()
        .with_context(|| format!("invalid value {:?}", raw))?;
    state.handle.apply(update(value)).await?;
    Ok(Json(Updated { status: "updated" }))
}

async fn set_flag(
    state: ControlState,
    raw: String,
    update: fn(bool) -> ParameterUpdate,
) -> ApiJsonResult<Updated> {
    let on = parse_flag(&raw).with_context(|| format!("invalid status {:?}", raw))?;
    state.handle.apply(update(on)).await?;
    Ok(Json(Updated { status: "updated" }))
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Some(true),
        "false" | "0" | "off" | "no" => Some(false),
        _ => None,
    }
}

fn strip_override(prompt: &str) -> String {
    prompt.replace(OVERRIDE_MARKER, "").trim().to_string()
}

#[cfg(test)]
#[path = "settings_test.rs"]
mod settings_test;
