use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use reqwest::{Url, header::CONTENT_TYPE};

use crate::{media::Frame, params::ParameterSnapshot};

/// The image transformation itself. Called from a blocking thread; may take seconds.
pub trait FrameTransformer: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Return exactly one output image per input frame, in order.
    fn transform(
        &self,
        frames: &[Frame],
        params: &[ParameterSnapshot],
    ) -> anyhow::Result<Vec<Bytes>>;
}

/// Hands the inbound payloads back unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct Passthrough;

impl FrameTransformer for Passthrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn transform(
        &self,
        frames: &[Frame],
        _params: &[ParameterSnapshot],
    ) -> anyhow::Result<Vec<Bytes>> {
        Ok(frames.iter().map(|f| f.image.data.clone()).collect())
    }
}

/// Posts each frame to a remote inference endpoint. The frame's parameters
/// go in the query string, the response body is the transformed image.
pub struct HttpTransformer {
    client: reqwest::Client,
    url: Url,
    runtime: tokio::runtime::Handle,
}

impl HttpTransformer {
    /// Must be called from within a tokio runtime.
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let url = Url::parse(url).with_context(|| format!("invalid transformer url {}", url))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        let runtime = tokio::runtime::Handle::try_current()
            .context("HttpTransformer needs a tokio runtime")?;
        Ok(Self {
            client,
            url,
            runtime,
        })
    }

    fn request_url(&self, params: &ParameterSnapshot) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("prompt", &params.prompt)
            .append_pair("seed", &params.seed.to_string())
            .append_pair("fixed_seed", &params.fixed_seed.to_string())
            .append_pair("strength", &params.strength.to_string())
            .append_pair("steps", &params.num_inference_steps.to_string())
            .append_pair("compel", &params.compel.to_string())
            .append_pair("mirror", &params.mirror.to_string())
            .append_pair("opacity", &params.opacity.to_string())
            .append_pair("debug", &params.debug.to_string())
            .append_pair("tint_color_1", &rgb(params.tint_color_1))
            .append_pair("tint_color_2", &rgb(params.tint_color_2))
            .append_pair("tint_strength", &params.tint_strength.to_string())
            .append_pair("tint_interval", &params.tint_interval_secs.to_string());
        url
    }

    async fn post_frame(&self, frame: &Frame, params: &ParameterSnapshot) -> anyhow::Result<Bytes> {
        let resp = self
            .client
            .post(self.request_url(params))
            .header(CONTENT_TYPE, "image/jpeg")
            .body(frame.image.data.clone())
            .send()
            .await
            .with_context(|| format!("post {}", frame))?
            .error_for_status()?;
        Ok(resp.bytes().await?)
    }

    async fn post_all(
        &self,
        frames: &[Frame],
        params: &[ParameterSnapshot],
    ) -> anyhow::Result<Vec<Bytes>> {
        let requests = frames
            .iter()
            .zip(params)
            .map(|(frame, params)| self.post_frame(frame, params));
        futures::future::try_join_all(requests).await
    }
}

impl FrameTransformer for HttpTransformer {
    fn name(&self) -> &str {
        self.url.as_str()
    }

    fn transform(
        &self,
        frames: &[Frame],
        params: &[ParameterSnapshot],
    ) -> anyhow::Result<Vec<Bytes>> {
        if frames.len() != params.len() {
            anyhow::bail!("{} frames but {} parameter sets", frames.len(), params.len());
        }
        self.runtime.block_on(self.post_all(frames, params))
    }
}

fn rgb([r, g, b]: [u8; 3]) -> String {
    format!("{},{},{}", r, g, b)
}

#[cfg(test)]
#[path = "transform_test.rs"]
mod transform_test;
