//! Encoding and validating decoding for the peer sync envelope.
//!
//! Frames are UTF-8 JSON. Decoding is strict about shape (every field a type
//! requires must be present and well-formed) and lenient about extras
//! (unknown fields are ignored). Malformed frames and unknown types are
//! reported as distinct errors so the receiver can log and drop them.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::message::{
    Envelope, LEGACY_TODO_UPDATE, Payload, SYNC_REQUEST, SYNC_RESPONSE, TODO_ADDED, TODO_DELETED,
    TODO_MOVED, TODO_ORDER_UPDATED,
};
use crate::task::{Task, TaskId};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame is not a valid envelope of its declared type.
    #[error("malformed message: {0}")]
    Malformed(String),
    /// The frame declares a type this peer does not understand.
    #[error("unknown message type: {0}")]
    UnknownType(String),
    /// Serialization failed on the sending side.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Encodes an [`Envelope`] as a JSON frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the envelope cannot be serialized.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(envelope).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes and validates an [`Envelope`] from a JSON frame.
///
/// Accepts the canonical upper-case type names as well as the legacy
/// `sync_request`, `sync_response` and `todo_update` forms.
///
/// # Errors
///
/// Returns `CodecError::Malformed` if the bytes are not a JSON object or a
/// required field is missing or ill-typed, and `CodecError::UnknownType` if
/// the `type` discriminator is not recognized.
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(format!("not JSON: {e}")))?;
    let Value::Object(obj) = value else {
        return Err(CodecError::Malformed("envelope is not an object".into()));
    };

    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| CodecError::Malformed("missing string field `type`".into()))?;

    let peer_id = match obj.get("peerId") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(CodecError::Malformed("`peerId` is not a string".into())),
    };

    let payload = match kind {
        SYNC_REQUEST | "sync_request" => Payload::SyncRequest,
        SYNC_RESPONSE | "sync_response" => decode_sync_response(&obj)?,
        TODO_ADDED => Payload::TodoAdded {
            todo: field(&obj, "todo")?,
        },
        TODO_DELETED => Payload::TodoDeleted {
            todo_id: deleted_id(&obj)?,
        },
        TODO_MOVED => Payload::TodoMoved {
            todo: field(&obj, "todo")?,
            new_day: field(&obj, "newDay")?,
        },
        TODO_ORDER_UPDATED => Payload::TodoOrderUpdated {
            day: field(&obj, "day")?,
            todos: field(&obj, "todos")?,
        },
        LEGACY_TODO_UPDATE => decode_legacy_update(&obj)?,
        other => return Err(CodecError::UnknownType(other.to_string())),
    };

    Ok(Envelope { peer_id, payload })
}

fn decode_sync_response(obj: &Map<String, Value>) -> Result<Payload, CodecError> {
    if obj.contains_key("todos") {
        return Ok(Payload::SyncResponse {
            todos: field(obj, "todos")?,
        });
    }
    if obj.contains_key("data") {
        let data: String = field(obj, "data")?;
        // Reject unusable exports here rather than at import time.
        decode_tasks(&data)?;
        return Ok(Payload::SyncImport { data });
    }
    Err(CodecError::Malformed(
        "sync response carries neither `todos` nor `data`".into(),
    ))
}

fn decode_legacy_update(obj: &Map<String, Value>) -> Result<Payload, CodecError> {
    let action: String = field(obj, "action")?;
    let todo: Task = field(obj, "todo")?;
    match action.as_str() {
        "add" => Ok(Payload::TodoAdded { todo }),
        "delete" => {
            let todo_id = todo
                .id
                .ok_or_else(|| CodecError::Malformed("delete without `todo.id`".into()))?;
            Ok(Payload::TodoDeleted { todo_id })
        }
        // Legacy moves carry the destination in the task itself.
        "move" => Ok(Payload::TodoMoved {
            new_day: todo.day,
            todo,
        }),
        other => Err(CodecError::Malformed(format!(
            "unknown todo_update action `{other}`"
        ))),
    }
}

fn deleted_id(obj: &Map<String, Value>) -> Result<TaskId, CodecError> {
    if obj.contains_key("todoId") {
        return field(obj, "todoId");
    }
    let todo: Task = field(obj, "todo")
        .map_err(|_| CodecError::Malformed("delete carries neither `todoId` nor `todo`".into()))?;
    todo.id
        .ok_or_else(|| CodecError::Malformed("delete without `todo.id`".into()))
}

fn field<T: DeserializeOwned>(obj: &Map<String, Value>, name: &str) -> Result<T, CodecError> {
    let raw = obj
        .get(name)
        .ok_or_else(|| CodecError::Malformed(format!("missing field `{name}`")))?;
    T::deserialize(raw).map_err(|e| CodecError::Malformed(format!("field `{name}`: {e}")))
}

/// Serializes a full task collection into the export format (a JSON array).
///
/// # Errors
///
/// Returns `CodecError::Serialization` if a task cannot be serialized.
pub fn export_tasks(tasks: &[Task]) -> Result<String, CodecError> {
    serde_json::to_string(tasks).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Parses a collection produced by [`export_tasks`].
///
/// # Errors
///
/// Returns `CodecError::Malformed` if the string is not a JSON array of tasks.
pub fn decode_tasks(data: &str) -> Result<Vec<Task>, CodecError> {
    serde_json::from_str(data).map_err(|e| CodecError::Malformed(format!("bad export: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Day;
    use chrono::{TimeZone, Utc};

    fn sample() -> Task {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        Task::new(1, Day::Monday, "x", ts)
    }

    #[test]
    fn encode_decode_preserves_envelope() {
        let env = Envelope::todo_moved(sample(), Day::Sunday).from_peer("a");
        let decoded = decode(&encode(&env).unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn decode_accepts_lowercase_sync_request() {
        let env = decode(br#"{"type":"sync_request"}"#).unwrap();
        assert_eq!(env.payload, Payload::SyncRequest);
        assert_eq!(env.peer_id, None);
    }

    #[test]
    fn decode_sync_response_with_data_string() {
        let data = export_tasks(&[sample()]).unwrap();
        let frame = serde_json::json!({ "type": "sync_response", "data": data });
        let env = decode(frame.to_string().as_bytes()).unwrap();
        assert_eq!(env.payload, Payload::SyncImport { data });
    }

    #[test]
    fn decode_sync_response_with_bad_data_is_malformed() {
        let frame = br#"{"type":"SYNC_RESPONSE","data":"not an export"}"#;
        assert!(matches!(decode(frame), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn decode_legacy_todo_update_actions() {
        let todo = serde_json::to_value(sample()).unwrap();

        let add = serde_json::json!({ "type": "todo_update", "action": "add", "todo": todo });
        let env = decode(add.to_string().as_bytes()).unwrap();
        assert_eq!(env.payload, Payload::TodoAdded { todo: sample() });

        let del = serde_json::json!({ "type": "todo_update", "action": "delete", "todo": todo });
        let env = decode(del.to_string().as_bytes()).unwrap();
        assert_eq!(
            env.payload,
            Payload::TodoDeleted {
                todo_id: TaskId::new(1)
            }
        );

        let mv = serde_json::json!({ "type": "todo_update", "action": "move", "todo": todo });
        let env = decode(mv.to_string().as_bytes()).unwrap();
        assert_eq!(
            env.payload,
            Payload::TodoMoved {
                todo: sample(),
                new_day: Day::Monday
            }
        );
    }

    #[test]
    fn decode_deleted_accepts_todo_object() {
        let frame = serde_json::json!({ "type": "TODO_DELETED", "todo": sample() });
        let env = decode(frame.to_string().as_bytes()).unwrap();
        assert_eq!(
            env.payload,
            Payload::TodoDeleted {
                todo_id: TaskId::new(1)
            }
        );
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let err = decode(br#"{"type":"TODO_RENAMED"}"#).unwrap_err();
        assert!(matches!(err, CodecError::UnknownType(t) if t == "TODO_RENAMED"));
    }

    #[test]
    fn decode_rejects_missing_fields() {
        assert!(matches!(
            decode(br#"{"type":"TODO_ADDED"}"#),
            Err(CodecError::Malformed(_))
        ));
        assert!(matches!(
            decode(br#"{"type":"TODO_MOVED","todo":{"id":1,"day":"Monday","content":"x"}}"#),
            Err(CodecError::Malformed(_))
        ));
        assert!(matches!(
            decode(br#"{"type":"TODO_ORDER_UPDATED","day":"Funday","todos":[]}"#),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn decode_rejects_non_objects() {
        assert!(matches!(decode(b"[1,2,3]"), Err(CodecError::Malformed(_))));
        assert!(matches!(decode(b"\xff\xfe"), Err(CodecError::Malformed(_))));
        assert!(matches!(decode(br#"{"peerId":"a"}"#), Err(CodecError::Malformed(_))));
        assert!(matches!(
            decode(br#"{"type":"SYNC_REQUEST","peerId":7}"#),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn export_round_trip_is_exact() {
        let tasks = vec![sample(), Task::draft(Day::Friday, "draft")];
        let data = export_tasks(&tasks).unwrap();
        assert_eq!(decode_tasks(&data).unwrap(), tasks);
    }
}
