use crate::auth::TokenSource;
use crate::mailbox::{MailError, MailResult, MailSession, MessageHeaders};

use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::Deserialize;
use url::Url;

pub const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me/";
const PAGE_SIZE: &str = "500";

/// Gmail REST API session for the authorized user.
pub struct GmailSession {
    client: Client,
    base: Url,
    tokens: Box<dyn TokenSource>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage {
    #[serde(default)]
    messages: Vec<MessageRef>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct Message {
    #[serde(default)]
    payload: Option<Payload>,
}

#[derive(Debug, Default, Deserialize)]
struct Payload {
    #[serde(default)]
    headers: Vec<Header>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

impl GmailSession {
    pub fn with_client(
        client: Client,
        api_base: &str,
        tokens: Box<dyn TokenSource>,
    ) -> anyhow::Result<Self> {
        let base = parse_base(api_base)?;
        Ok(Self {
            client,
            base,
            tokens,
        })
    }

    fn url(&self, path: &str) -> MailResult<Url> {
        self.base
            .join(path)
            .map_err(|e| MailError::Other(format!("Bad API path '{path}': {e}")))
    }

    fn send(&mut self, request: RequestBuilder, id: &str) -> MailResult<Response> {
        with_auth_retry(self.tokens.as_mut(), |token| {
            let attempt = request
                .try_clone()
                .ok_or_else(|| MailError::Other("request body cannot be resent".into()))?;
            execute(attempt, token, id)
        })
    }

    fn list_page(&mut self, query: &str, page_token: Option<&str>) -> MailResult<ListPage> {
        let mut request = self
            .client
            .get(self.url("messages")?)
            .query(&[("q", query), ("maxResults", PAGE_SIZE)]);
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }
        let page: ListPage = self.send(request, "")?.json()?;
        log::debug!(
            "Listed {} message(s), more pages: {}",
            page.messages.len(),
            page.next_page_token.is_some()
        );
        Ok(page)
    }

    fn modify(&mut self, id: &str, field: &str, label: &str) -> MailResult<()> {
        let mut body = serde_json::Map::new();
        body.insert(field.to_string(), serde_json::json!([label]));
        let request = self
            .client
            .post(self.url(&format!("messages/{id}/modify"))?)
            .json(&body);
        self.send(request, id)?;
        Ok(())
    }
}

impl MailSession for GmailSession {
    fn list_message_ids(&mut self, query: &str) -> MailResult<Vec<String>> {
        collect_pages(|token| self.list_page(query, token))
    }

    fn get_headers(&mut self, id: &str) -> MailResult<MessageHeaders> {
        let request = self
            .client
            .get(self.url(&format!("messages/{id}"))?)
            .query(&[
                ("format", "metadata"),
                ("metadataHeaders", "From"),
                ("metadataHeaders", "Subject"),
            ]);
        let message: Message = self.send(request, id)?.json()?;
        Ok(headers_of(message))
    }

    fn trash(&mut self, id: &str) -> MailResult<()> {
        let request = self.client.post(self.url(&format!("messages/{id}/trash"))?);
        self.send(request, id)?;
        Ok(())
    }

    fn add_label(&mut self, id: &str, label: &str) -> MailResult<()> {
        self.modify(id, "addLabelIds", label)
    }

    fn remove_label(&mut self, id: &str, label: &str) -> MailResult<()> {
        self.modify(id, "removeLabelIds", label)
    }
}

fn execute(request: RequestBuilder, token: &str, id: &str) -> MailResult<Response> {
    let response = request.bearer_auth(token).send()?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(status_error(status.as_u16(), id, &body))
}

/// Run `attempt` with the current access token. If the provider rejects it,
/// refresh once and try again; only a failed refresh or a second rejection
/// reaches the caller as an auth error.
fn with_auth_retry<T, F>(tokens: &mut dyn TokenSource, mut attempt: F) -> MailResult<T>
where
    F: FnMut(&str) -> MailResult<T>,
{
    let token = tokens.access_token()?;
    match attempt(&token) {
        Err(e) if e.is_auth() => {
            log::info!("Access token rejected ({e}), refreshing and retrying");
            let token = tokens.refresh()?;
            attempt(&token)
        }
        other => other,
    }
}

fn parse_base(api_base: &str) -> anyhow::Result<Url> {
    // Url::join drops the last path segment unless the base ends with '/'
    let normalized = if api_base.ends_with('/') {
        api_base.to_string()
    } else {
        format!("{api_base}/")
    };
    Url::parse(&normalized).map_err(|e| anyhow::anyhow!("Invalid API base URL '{}': {}", api_base, e))
}

/// Follow `nextPageToken` until the listing is exhausted.
fn collect_pages<F>(mut fetch: F) -> MailResult<Vec<String>>
where
    F: FnMut(Option<&str>) -> MailResult<ListPage>,
{
    let mut ids = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = fetch(token.as_deref())?;
        ids.extend(page.messages.into_iter().map(|m| m.id));
        match page.next_page_token {
            Some(next) if !next.is_empty() => token = Some(next),
            _ => return Ok(ids),
        }
    }
}

fn headers_of(message: Message) -> MessageHeaders {
    let mut headers = MessageHeaders::default();
    let Some(payload) = message.payload else {
        return headers;
    };
    // First occurrence wins, names compared case-insensitively
    let mut seen_from = false;
    let mut seen_subject = false;
    for header in payload.headers {
        if !seen_from && header.name.eq_ignore_ascii_case("from") {
            headers.from = header.value;
            seen_from = true;
        } else if !seen_subject && header.name.eq_ignore_ascii_case("subject") {
            headers.subject = header.value;
            seen_subject = true;
        }
    }
    headers
}

fn status_error(status: u16, id: &str, body: &str) -> MailError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.trim().to_string());

    match status {
        401 => MailError::AuthExpired(message),
        404 => MailError::NotFound(id.to_string()),
        429 => MailError::RateLimited,
        _ => MailError::Api { status, message },
    }
}
