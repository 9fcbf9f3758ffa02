use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{MessageId, OrganizationId, RoomId, UserId},
    error::{ApiError, ApiException, ErrorCode},
    protocol::{
        Attachment, Message, MessagePatch, NewAttachment, NewMembership, NewMessage, NewRoom,
        Room, RoomMember, StoredFile, UnreadCount, UserProfile,
    },
};
use tracing::debug;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn current_user(&self) -> Result<UserProfile>;
    async fn list_rooms(&self, organization_id: OrganizationId, user_id: UserId)
        -> Result<Vec<Room>>;
    async fn fetch_room(&self, room_id: RoomId) -> Result<Room>;
    async fn create_room(&self, room: NewRoom) -> Result<Room>;
    /// Up to `limit` messages created before `before` (newest page when
    /// `None`), oldest first.
    async fn fetch_messages(
        &self,
        room_id: RoomId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>>;
    async fn insert_message(&self, message: NewMessage) -> Result<Message>;
    async fn update_message(&self, message_id: MessageId, patch: MessagePatch) -> Result<Message>;
    async fn delete_message(&self, message_id: MessageId) -> Result<()>;
    /// Fails with an [`ApiException`] carrying [`ErrorCode::Conflict`] when
    /// the user is already a member.
    async fn insert_membership(&self, membership: NewMembership) -> Result<RoomMember>;
    async fn delete_membership(&self, room_id: RoomId, user_id: UserId) -> Result<()>;
    async fn list_members(&self, room_id: RoomId) -> Result<Vec<RoomMember>>;
    async fn list_profiles(
        &self,
        organization_id: OrganizationId,
        user_ids: &[UserId],
    ) -> Result<Vec<UserProfile>>;
    async fn upload_file(&self, path: &str, bytes: Vec<u8>, mime_type: &str) -> Result<StoredFile>;
    async fn remove_files(&self, paths: &[String]) -> Result<()>;
    async fn insert_attachment(&self, attachment: NewAttachment) -> Result<Attachment>;
    async fn list_attachments(&self, message_id: MessageId) -> Result<Vec<Attachment>>;
    async fn delete_attachments(&self, message_id: MessageId) -> Result<()>;
    async fn unread_counts(&self, user_id: UserId) -> Result<Vec<UnreadCount>>;
}

/// True when `err` is the remote's "already exists" answer.
pub fn is_conflict(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<ApiException>()
            .is_some_and(ApiException::is_conflict)
    })
}

#[derive(Serialize)]
struct RemoveFilesRequest<'a> {
    paths: &'a [String],
}

pub struct HttpRemoteStore {
    http: Client,
    base_url: String,
    access_token: Option<String>,
}

impl HttpRemoteStore {
    pub fn new(
        base_url: impl Into<String>,
        access_token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .authorized(self.http.get(self.url(path)))
            .send()
            .await
            .with_context(|| format!("GET {path}"))?;
        decode(response).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .authorized(self.http.post(self.url(path)).json(body))
            .send()
            .await
            .with_context(|| format!("POST {path}"))?;
        decode(response).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let response = self
            .authorized(self.http.delete(self.url(path)))
            .send()
            .await
            .with_context(|| format!("DELETE {path}"))?;
        ensure_success(response).await.map(|_| ())
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    debug!(status = status.as_u16(), %body, "remote store request failed");
    let exception = match serde_json::from_str::<ApiError>(&body) {
        Ok(error) => ApiException::from(error),
        Err(_) => ApiException::new(ErrorCode::from_status(status.as_u16()), status.to_string()),
    };
    Err(exception.into())
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let response = ensure_success(response).await?;
    response
        .json::<T>()
        .await
        .map_err(|e| anyhow!("invalid response body from remote store: {e}"))
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn current_user(&self) -> Result<UserProfile> {
        self.get_json("/me").await
    }

    async fn list_rooms(
        &self,
        organization_id: OrganizationId,
        user_id: UserId,
    ) -> Result<Vec<Room>> {
        self.get_json(&format!(
            "/organizations/{organization_id}/rooms?user_id={user_id}"
        ))
        .await
    }

    async fn fetch_room(&self, room_id: RoomId) -> Result<Room> {
        self.get_json(&format!("/rooms/{room_id}")).await
    }

    async fn create_room(&self, room: NewRoom) -> Result<Room> {
        self.post_json("/rooms", &room).await
    }

    async fn fetch_messages(
        &self,
        room_id: RoomId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let path = format!("/rooms/{room_id}/messages");
        let mut query = vec![("limit", limit.to_string())];
        if let Some(before) = before {
            query.push(("before", before.to_rfc3339()));
        }
        let response = self
            .authorized(self.http.get(self.url(&path)).query(&query))
            .send()
            .await
            .with_context(|| format!("GET {path}"))?;
        decode(response).await
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message> {
        self.post_json("/messages", &message).await
    }

    async fn update_message(&self, message_id: MessageId, patch: MessagePatch) -> Result<Message> {
        let path = format!("/messages/{message_id}");
        let response = self
            .authorized(self.http.patch(self.url(&path)).json(&patch))
            .send()
            .await
            .with_context(|| format!("PATCH {path}"))?;
        decode(response).await
    }

    async fn delete_message(&self, message_id: MessageId) -> Result<()> {
        self.delete(&format!("/messages/{message_id}")).await
    }

    async fn insert_membership(&self, membership: NewMembership) -> Result<RoomMember> {
        self.post_json(&format!("/rooms/{}/members", membership.room_id), &membership)
            .await
    }

    async fn delete_membership(&self, room_id: RoomId, user_id: UserId) -> Result<()> {
        self.delete(&format!("/rooms/{room_id}/members/{user_id}"))
            .await
    }

    async fn list_members(&self, room_id: RoomId) -> Result<Vec<RoomMember>> {
        self.get_json(&format!("/rooms/{room_id}/members")).await
    }

    async fn list_profiles(
        &self,
        organization_id: OrganizationId,
        user_ids: &[UserId],
    ) -> Result<Vec<UserProfile>> {
        let ids = user_ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.get_json(&format!(
            "/organizations/{organization_id}/profiles?ids={ids}"
        ))
        .await
    }

    async fn upload_file(&self, path: &str, bytes: Vec<u8>, mime_type: &str) -> Result<StoredFile> {
        let route = format!("/storage/attachments/{path}");
        let response = self
            .authorized(
                self.http
                    .post(self.url(&route))
                    .header(reqwest::header::CONTENT_TYPE, mime_type)
                    .body(bytes),
            )
            .send()
            .await
            .with_context(|| format!("POST {route}"))?;
        decode(response).await
    }

    async fn remove_files(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let route = "/storage/attachments";
        let response = self
            .authorized(
                self.http
                    .delete(self.url(route))
                    .json(&RemoveFilesRequest { paths }),
            )
            .send()
            .await
            .with_context(|| format!("DELETE {route}"))?;
        ensure_success(response).await.map(|_| ())
    }

    async fn insert_attachment(&self, attachment: NewAttachment) -> Result<Attachment> {
        self.post_json("/attachments", &attachment).await
    }

    async fn list_attachments(&self, message_id: MessageId) -> Result<Vec<Attachment>> {
        self.get_json(&format!("/messages/{message_id}/attachments"))
            .await
    }

    async fn delete_attachments(&self, message_id: MessageId) -> Result<()> {
        self.delete(&format!("/messages/{message_id}/attachments"))
            .await
    }

    async fn unread_counts(&self, user_id: UserId) -> Result<Vec<UnreadCount>> {
        self.get_json(&format!("/users/{user_id}/unread")).await
    }
}

#[cfg(test)]
#[path = "tests/remote_tests.rs"]
mod tests;
