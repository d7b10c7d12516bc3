//! JSON messages exchanged over `/ws`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use world_hub_core::transport::WorldSnapshot;
use world_hub_core::{Request, Response};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Request(Request),
    #[serde(rename_all = "camelCase")]
    World { request_id: Uuid },
}

impl ClientMessage {
    pub fn request_id(&self) -> Uuid {
        match self {
            Self::Request(request) => request.request_id,
            Self::World { request_id } => *request_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Acknowledges the receiving session's own request.
    Response(Response),
    #[serde(rename_all = "camelCase")]
    World {
        request_id: Uuid,
        snapshot: WorldSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    Rejected { request_id: Uuid, reason: String },
    /// A request another session made.
    Broadcast(Response),
}

impl ServerMessage {
    /// The request this message answers; `None` for broadcasts.
    pub fn reply_to(&self) -> Option<Uuid> {
        match self {
            Self::Response(response) => Some(response.request.request_id),
            Self::World { request_id, .. } | Self::Rejected { request_id, .. } => Some(*request_id),
            Self::Broadcast(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use world_hub_core::{DocumentKind, Operation, OperationOptions};

    #[test]
    fn messages_are_tagged() {
        let request = Request::new(
            Operation::Create,
            DocumentKind::ACTOR,
            None,
            vec![json!({"name": "Goblin"})],
            OperationOptions::default(),
        );
        let id = request.request_id;
        let value = serde_json::to_value(ClientMessage::Request(request)).unwrap();
        assert_eq!(value["type"], "request");
        assert_eq!(value["operation"], "create");
        assert_eq!(value["kind"], "Actor");

        let parsed: ClientMessage = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.request_id(), id);

        let rejected = ServerMessage::Rejected {
            request_id: id,
            reason: "nope".into(),
        };
        let value = serde_json::to_value(&rejected).unwrap();
        assert_eq!(value["type"], "rejected");
        assert_eq!(value["requestId"], id.to_string());
        assert_eq!(rejected.reply_to(), Some(id));
    }
}
