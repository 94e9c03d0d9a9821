use proptest::prelude::*;

use crate::support::{Journal, Recording, bytes, fixture, names};

/// 入站按注册顺序、出站按逆序经过过滤器。
#[test]
fn inbound_follows_registration_and_outbound_reverses_it() {
    let fx = fixture();
    let journal = Journal::default();
    let chain = fx.session.filter_chain();
    for label in ["A", "B", "C"] {
        chain
            .add_last(label, Recording::new(label, &journal))
            .expect("add filter");
    }

    assert_eq!(names(&fx.session), ["A", "B", "C"]);
    let reversed: Vec<String> = chain
        .get_all_reversed()
        .iter()
        .map(|entry| entry.name().to_owned())
        .collect();
    assert_eq!(reversed, ["C", "B", "A"]);

    chain.fire_message_received(bytes(b"ping"));
    assert_eq!(journal.take(), ["A:in", "B:in", "C:in"]);
    assert_eq!(fx.handler.received_bytes(), [b"ping".to_vec()]);

    let future = fx.session.write(bytes(b"pong"));
    assert_eq!(journal.take(), ["C:out", "B:out", "A:out"]);
    assert_eq!(fx.session.pending_writes(), 1, "Head 应把请求压入写队列");
    assert!(!future.is_done());
}

/// 四种插入位置。
#[test]
fn positional_insertions() {
    let fx = fixture();
    let journal = Journal::default();
    let chain = fx.session.filter_chain();
    chain.add_last("m", Recording::new("m", &journal)).expect("m");
    chain.add_first("a", Recording::new("a", &journal)).expect("a");
    chain.add_last("z", Recording::new("z", &journal)).expect("z");
    chain.add_before("m", "l", Recording::new("l", &journal)).expect("l");
    chain.add_after("m", "n", Recording::new("n", &journal)).expect("n");

    assert_eq!(names(&fx.session), ["a", "l", "m", "n", "z"]);
    assert!(chain.get_next_filter("m").is_some());
    assert!(chain.get_next_filter("head").is_none(), "哨兵不可按名称查找");
}

#[derive(Clone, Debug)]
enum Op {
    First,
    Last,
    Before(usize),
    After(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::First),
        Just(Op::Last),
        any::<usize>().prop_map(Op::Before),
        any::<usize>().prop_map(Op::After),
    ]
}

const LABELS: [&str; 12] = ["f0", "f1", "f2", "f3", "f4", "f5", "f6", "f7", "f8", "f9", "f10", "f11"];

proptest! {
    /// 任意插入序列下，链序与参考模型一致，派发顺序与链序一致。
    #[test]
    fn dispatch_order_matches_model(ops in proptest::collection::vec(op(), 1..LABELS.len())) {
        let fx = fixture();
        let journal = Journal::default();
        let chain = fx.session.filter_chain();
        let mut model: Vec<&str> = Vec::new();

        for (label, op) in LABELS.iter().copied().zip(ops) {
            let filter = Recording::new(label, &journal);
            match op {
                Op::First => {
                    chain.add_first(label, filter).expect("add_first");
                    model.insert(0, label);
                }
                Op::Last => {
                    chain.add_last(label, filter).expect("add_last");
                    model.push(label);
                }
                Op::Before(i) if !model.is_empty() => {
                    let at = i % model.len();
                    chain.add_before(model[at], label, filter).expect("add_before");
                    model.insert(at, label);
                }
                Op::After(i) if !model.is_empty() => {
                    let at = i % model.len();
                    chain.add_after(model[at], label, filter).expect("add_after");
                    model.insert(at + 1, label);
                }
                Op::Before(_) | Op::After(_) => {
                    chain.add_last(label, filter).expect("add_last");
                    model.push(label);
                }
            }
        }

        prop_assert_eq!(names(&fx.session), model.clone());

        chain.fire_message_received(bytes(b"x"));
        let inbound: Vec<String> = model.iter().map(|l| format!("{l}:in")).collect();
        prop_assert_eq!(journal.take(), inbound);

        fx.session.write(bytes(b"y"));
        let outbound: Vec<String> = model.iter().rev().map(|l| format!("{l}:out")).collect();
        prop_assert_eq!(journal.take(), outbound);
    }
}
