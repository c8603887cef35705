//! Wire payloads exchanged with the hosting worker and the reply transport.
//!
//! Field names serialize camelCase so records stay readable next to the
//! documents the previous store generation wrote.

use serde::{Deserialize, Serialize};

/// Reply destination on the message bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub queue: String,
    pub event: String,
}

/// Where a query came from and where its answer should go back to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteInfo {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Destination>,
}

/// The question body as persisted in audit records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionBody {
    pub message: String,
    /// Platform-specific retrieval filters, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<serde_json::Value>,
}

/// The answer body as persisted in audit records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    pub message: String,
}

/// A query handed to the engine by the hosting worker.
///
/// `route`, `filters` and `metadata` are reply-path baggage: the engine
/// never interprets them, it records them verbatim so the transport can
/// replay a run end to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub community_id: String,
    pub query: String,
    /// When false the gating cascade is bypassed and an answer is always
    /// attempted; when true the engine may decide the query deserves none.
    #[serde(default)]
    pub skip_enabled: bool,
    /// Conversation key for session memory; absent for one-shot queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl QueryRequest {
    pub fn new(community_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            community_id: community_id.into(),
            query: query.into(),
            skip_enabled: false,
            session_id: None,
            route: None,
            filters: None,
            metadata: None,
        }
    }

    pub fn with_skip_enabled(mut self, skip_enabled: bool) -> Self {
        self.skip_enabled = skip_enabled;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_route(mut self, route: RouteInfo) -> Self {
        self.route = Some(route);
        self
    }

    pub fn with_filters(mut self, filters: serde_json::Value) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// The question body persisted into this request's audit record.
    pub fn question_body(&self) -> QuestionBody {
        QuestionBody {
            message: self.query.clone(),
            filters: self.filters.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_request_deserializes_with_defaults() {
        let req: QueryRequest =
            serde_json::from_value(json!({"communityId": "c1", "query": "why?"})).unwrap();
        assert_eq!(req.community_id, "c1");
        assert!(!req.skip_enabled);
        assert!(req.session_id.is_none());
        assert!(req.route.is_none());
    }

    #[test]
    fn request_serializes_camel_case() {
        let req = QueryRequest::new("c1", "why?")
            .with_skip_enabled(true)
            .with_session("s-9");
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["communityId"], "c1");
        assert_eq!(v["skipEnabled"], true);
        assert_eq!(v["sessionId"], "s-9");
        // Absent optionals are omitted, not null.
        assert!(v.get("route").is_none());
    }

    #[test]
    fn route_info_round_trips() {
        let route = RouteInfo {
            source: "discord".to_string(),
            destination: Some(Destination {
                queue: "DISCORD_BOT".to_string(),
                event: "SEND_MESSAGE".to_string(),
            }),
        };
        let v = serde_json::to_value(&route).unwrap();
        assert_eq!(v["destination"]["queue"], "DISCORD_BOT");
        let back: RouteInfo = serde_json::from_value(v).unwrap();
        assert_eq!(back, route);
    }

    #[test]
    fn question_body_carries_filters() {
        let req = QueryRequest::new("c1", "what changed?")
            .with_filters(json!({"channel": "general"}));
        let q = req.question_body();
        assert_eq!(q.message, "what changed?");
        assert_eq!(q.filters.unwrap()["channel"], "general");
    }
}
