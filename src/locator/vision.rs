use super::traits::{LocatorSource, VisionHit, VisionLocator, VisionQuery};
use crate::config::VisionConfig;
use crate::coords::Space;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Serialize;
use std::time::Duration;

#[derive(Serialize)]
struct LocateRequest<'a> {
    image: &'a str,
    target_description: &'a str,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
    width: u32,
    height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

/// Build the locate prompt sent alongside the screenshot.
fn locate_prompt(query: &VisionQuery<'_>, space: Space) -> String {
    let grid = match space {
        Space::Normalized => {
            "Answer with x,y on a 0-999 grid where (0,0) is the top-left corner.".to_string()
        }
        Space::Viewport | Space::VendorSdk => format!(
            "Answer with x,y in pixels from the top-left corner of a {}x{} image.",
            query.viewport.width, query.viewport.height
        ),
    };
    let mut prompt = format!(
        "Locate the CENTER of this UI element: \"{}\". {grid} \
         If the element is not visible, answer found=false.",
        query.target
    );
    if let Some(context) = query.context.filter(|c| !c.trim().is_empty()) {
        prompt.push_str(&format!("\nContext: {context}"));
    }
    prompt
}

/// Vision locator backed by an HTTP service.
pub struct HttpVisionLocator {
    source: LocatorSource,
    endpoint: Url,
    api_key: Option<String>,
    native_space: Space,
    model: Option<String>,
    client: Client,
}

impl HttpVisionLocator {
    /// Build from config. `Ok(None)` when the source has no endpoint.
    pub fn from_config(
        source: LocatorSource,
        config: &VisionConfig,
        timeout: Duration,
    ) -> anyhow::Result<Option<Self>> {
        let Some(endpoint) = config
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
        else {
            return Ok(None);
        };
        if source == LocatorSource::Dom {
            anyhow::bail!("A vision locator cannot fill the DOM slot");
        }
        let endpoint = Url::parse(endpoint)
            .map_err(|_| anyhow::anyhow!("Invalid vision endpoint for {source}: '{endpoint}'"))?;

        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        Ok(Some(Self {
            source,
            endpoint,
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            native_space: config.native_space,
            model: config.model.clone(),
            client,
        }))
    }
}

#[async_trait]
impl VisionLocator for HttpVisionLocator {
    fn source(&self) -> LocatorSource {
        self.source
    }

    fn native_space(&self) -> Space {
        self.native_space
    }

    async fn locate(&self, query: &VisionQuery<'_>) -> anyhow::Result<VisionHit> {
        let request = LocateRequest {
            image: query.image_base64,
            target_description: query.target,
            prompt: locate_prompt(query, self.native_space),
            context: query.context,
            width: query.viewport.width,
            height: query.viewport.height,
            model: self.model.as_deref(),
        };

        let mut builder = self.client.post(self.endpoint.clone()).json(&request);
        if let Some(token) = self.api_key.as_deref() {
            builder = builder.bearer_auth(token.trim());
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("{} request failed", self.source))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} error ({status}): {}", self.source, body.trim());
        }

        let hit: VisionHit = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", self.source))?;
        if hit.found && !(hit.x.is_finite() && hit.y.is_finite()) {
            anyhow::bail!("{} returned a non-finite coordinate", self.source);
        }
        Ok(hit)
    }
}
