use evstream::publisher::PublishableMessage;
use evstream_macros::PublishableMessage;
use serde::Serialize;

#[derive(Serialize, PublishableMessage)]
#[message(event = "ITEM_ADDED", channel = "carts")]
struct ItemAdded<T>
where
    T: Serialize + Send + Sync,
{
    cart_id: String,
    item: T,
}

fn main() {
    let msg = ItemAdded {
        cart_id: "c1".to_string(),
        item: 7u32,
    };
    assert_eq!(msg.event_type(), "ITEM_ADDED");
    assert_eq!(ItemAdded::<u32>::CHANNEL, "carts");
    assert_eq!(msg.item, 7);
    assert_eq!(msg.cart_id, "c1");
}
