use evstream::publisher::PublishableMessage;
use evstream_macros::PublishableMessage;
use serde::Serialize;

#[derive(Debug, Serialize, PublishableMessage)]
#[message(event = "USER_CREATED", channel = "users")]
struct UserCreated {
    id: String,
}

#[derive(Serialize, PublishableMessage)]
#[message(event = "ORDER_PLACED")]
#[message(channel = "orders")]
enum OrderPlaced {
    Online { id: String },
    InStore,
}

fn main() {
    let msg = UserCreated { id: "u1".into() };
    assert_eq!(msg.event_type(), "USER_CREATED");
    assert_eq!(msg.channel(), "users");
    assert_eq!(UserCreated::EVENT_TYPE, "USER_CREATED");
    assert_eq!(UserCreated::CHANNEL, "users");

    let order = OrderPlaced::InStore;
    assert_eq!(order.event_type(), "ORDER_PLACED");
    assert_eq!(OrderPlaced::CHANNEL, "orders");
    let _ = OrderPlaced::Online { id: "o1".into() };
}
