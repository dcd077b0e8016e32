//! Property-based tests for the sync envelope codec.
//!
//! 1. Any valid `Envelope` survives encode → decode.
//! 2. Random bytes never cause a panic in `decode`.
//! 3. Any task collection survives export → import exactly.

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use weektodo_proto::codec;
use weektodo_proto::message::{Envelope, Payload};
use weektodo_proto::task::{Day, Task, TaskId};

fn arb_day() -> impl Strategy<Value = Day> {
    prop::sample::select(Day::ALL.to_vec())
}

fn arb_task() -> impl Strategy<Value = Task> {
    (
        prop::option::of(0i64..=9_999_999_999_999),
        arb_day(),
        ".{0,64}",
        prop::option::of(0i64..=4_102_444_800_000),
    )
        .prop_map(|(id, day, content, millis)| Task {
            id: id.map(TaskId::new),
            day,
            content,
            last_modified: millis.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        })
}

fn arb_payload() -> impl Strategy<Value = Payload> {
    prop_oneof![
        Just(Payload::SyncRequest),
        prop::collection::vec(arb_task(), 0..8).prop_map(|todos| Payload::SyncResponse { todos }),
        arb_task().prop_map(|todo| Payload::TodoAdded { todo }),
        any::<i64>().prop_map(|id| Payload::TodoDeleted {
            todo_id: TaskId::new(id)
        }),
        (arb_task(), arb_day()).prop_map(|(todo, new_day)| Payload::TodoMoved { todo, new_day }),
        (arb_day(), prop::collection::vec(arb_task(), 0..8))
            .prop_map(|(day, todos)| Payload::TodoOrderUpdated { day, todos }),
    ]
}

fn arb_envelope() -> impl Strategy<Value = Envelope> {
    (prop::option::of("[a-z0-9-]{1,36}"), arb_payload())
        .prop_map(|(peer_id, payload)| Envelope { peer_id, payload })
}

proptest! {
    #[test]
    fn envelope_survives_encoding(envelope in arb_envelope()) {
        let bytes = codec::encode(&envelope).unwrap();
        let decoded = codec::decode(&bytes).unwrap();
        prop_assert_eq!(decoded, envelope);
    }

    #[test]
    fn random_bytes_decode_no_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = codec::decode(&bytes);
    }

    #[test]
    fn random_json_objects_decode_no_panic(kind in ".{0,24}", field in ".{0,24}") {
        let frame = serde_json::json!({ "type": kind, field: 1 });
        let _ = codec::decode(frame.to_string().as_bytes());
    }

    #[test]
    fn export_import_reproduces_collection(tasks in prop::collection::vec(arb_task(), 0..32)) {
        let data = codec::export_tasks(&tasks).unwrap();
        prop_assert_eq!(codec::decode_tasks(&data).unwrap(), tasks);
    }
}
