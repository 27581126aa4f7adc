//! vCenter REST API: sessions and the tagging service

use async_trait::async_trait;
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::http::{read_json, SESSION_HEADER};
use crate::types::{Category, MoRef, Tag};

/// Trait abstracting the REST endpoints the actuator uses
#[async_trait]
pub trait RestClient: Send + Sync {
    /// Whether the REST session is still valid
    async fn session_is_active(&self) -> Result<bool>;

    /// End the REST session
    async fn logout(&self) -> Result<()>;

    /// Read a tag by id
    async fn get_tag(&self, id: &str) -> Result<Tag>;

    /// Ids of all tags
    async fn list_tags(&self) -> Result<Vec<String>>;

    /// Create a tag and return its id
    async fn create_tag(&self, name: &str, category_id: &str) -> Result<String>;

    /// Delete a tag
    async fn delete_tag(&self, id: &str) -> Result<()>;

    /// Read a category by id
    async fn get_category(&self, id: &str) -> Result<Category>;

    /// Ids of all categories
    async fn list_categories(&self) -> Result<Vec<String>>;

    /// Create a category and return its id
    async fn create_category(&self, name: &str, cardinality: &str) -> Result<String>;

    /// Delete a category
    async fn delete_category(&self, id: &str) -> Result<()>;

    /// Ids of the tags attached to an object
    async fn list_attached_tags(&self, object: &MoRef) -> Result<Vec<String>>;

    /// Attach a tag to an object
    async fn attach_tag(&self, tag_id: &str, object: &MoRef) -> Result<()>;

    /// Detach a tag from an object
    async fn detach_tag(&self, tag_id: &str, object: &MoRef) -> Result<()>;
}

/// REST client bound to one session token
pub struct HttpRestClient {
    http: reqwest::Client,
    base: Url,
    token: String,
}

fn rest_error(status: u16, body: &Value) -> Error {
    let message = body
        .pointer("/messages/0/default_message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| body.as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string());
    match status {
        404 => Error::not_found("object", message),
        401 => Error::not_authenticated(message),
        _ => Error::http(Some(status), message),
    }
}

fn object_id(object: &MoRef) -> Value {
    json!({ "object_id": { "id": object.value, "type": object.type_ } })
}

impl HttpRestClient {
    /// Create a REST session with basic auth
    pub async fn login(
        http: reqwest::Client,
        server: &Url,
        username: &str,
        password: &str,
    ) -> Result<Self> {
        let base = server
            .join("api/")
            .map_err(|e| Error::invalid_argument(e.to_string()))?;
        let url = base
            .join("session")
            .map_err(|e| Error::invalid_argument(e.to_string()))?;
        let response = http
            .post(url)
            .basic_auth(username, Some(password))
            .send()
            .await?;
        let token = read_json(response, rest_error).await?;
        let token = token
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::decode("session response is not a token string"))?;

        debug!(server = %server, username, "vCenter REST login succeeded");
        Ok(Self { http, base, token })
    }

    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = self
            .base
            .join(path)
            .map_err(|e| Error::invalid_argument(e.to_string()))?;
        let mut request = self
            .http
            .request(method, url)
            .header(SESSION_HEADER, &self.token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        read_json(request.send().await?, rest_error).await
    }

    async fn call_as<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        Ok(serde_json::from_value(
            self.call(Method::GET, path, None).await?,
        )?)
    }
}

#[async_trait]
impl RestClient for HttpRestClient {
    async fn session_is_active(&self) -> Result<bool> {
        match self.call(Method::GET, "session", None).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_authenticated() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn logout(&self) -> Result<()> {
        match self.call(Method::DELETE, "session", None).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_authenticated() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_tag(&self, id: &str) -> Result<Tag> {
        self.call_as(&format!("cis/tagging/tag/{id}")).await
    }

    async fn list_tags(&self) -> Result<Vec<String>> {
        self.call_as("cis/tagging/tag").await
    }

    async fn create_tag(&self, name: &str, category_id: &str) -> Result<String> {
        let id = self
            .call(
                Method::POST,
                "cis/tagging/tag",
                Some(json!({ "name": name, "category_id": category_id, "description": "" })),
            )
            .await?;
        Ok(serde_json::from_value(id)?)
    }

    async fn delete_tag(&self, id: &str) -> Result<()> {
        self.call(Method::DELETE, &format!("cis/tagging/tag/{id}"), None)
            .await
            .map(drop)
    }

    async fn get_category(&self, id: &str) -> Result<Category> {
        self.call_as(&format!("cis/tagging/category/{id}")).await
    }

    async fn list_categories(&self) -> Result<Vec<String>> {
        self.call_as("cis/tagging/category").await
    }

    async fn create_category(&self, name: &str, cardinality: &str) -> Result<String> {
        let id = self
            .call(
                Method::POST,
                "cis/tagging/category",
                Some(json!({
                    "name": name,
                    "cardinality": cardinality,
                    "description": "",
                    "associable_types": [],
                })),
            )
            .await?;
        Ok(serde_json::from_value(id)?)
    }

    async fn delete_category(&self, id: &str) -> Result<()> {
        self.call(Method::DELETE, &format!("cis/tagging/category/{id}"), None)
            .await
            .map(drop)
    }

    async fn list_attached_tags(&self, object: &MoRef) -> Result<Vec<String>> {
        let ids = self
            .call(
                Method::POST,
                "cis/tagging/tag-association?action=list-attached-tags",
                Some(object_id(object)),
            )
            .await?;
        Ok(serde_json::from_value(ids)?)
    }

    async fn attach_tag(&self, tag_id: &str, object: &MoRef) -> Result<()> {
        self.call(
            Method::POST,
            &format!("cis/tagging/tag-association/{tag_id}?action=attach"),
            Some(object_id(object)),
        )
        .await
        .map(drop)
    }

    async fn detach_tag(&self, tag_id: &str, object: &MoRef) -> Result<()> {
        self.call(
            Method::POST,
            &format!("cis/tagging/tag-association/{tag_id}?action=detach"),
            Some(object_id(object)),
        )
        .await
        .map(drop)
    }
}
