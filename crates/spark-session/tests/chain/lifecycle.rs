use std::sync::Arc;

use spark_session::{
    ChainError, CoreError, Filter, FilterChain, LifecyclePhase, NextFilter, error::codes,
};

use crate::support::{Journal, Recording, fixture, names};

const HOOK_FAILED: &str = "test.hook_failed";

/// 记录生命周期钩子，可按阶段注入失败。
struct Hooked {
    journal: Journal,
    fail_at: Option<LifecyclePhase>,
}

impl Hooked {
    fn new(journal: &Journal, fail_at: Option<LifecyclePhase>) -> Arc<dyn Filter> {
        Arc::new(Self {
            journal: journal.clone(),
            fail_at,
        })
    }

    fn hook(&self, phase: LifecyclePhase, chain: &FilterChain, name: &str, next: &NextFilter) -> Result<(), CoreError> {
        let bound = chain.get_next_filter(name).map(|handle| handle == *next);
        self.journal.push(format!("{name}:{phase}:{bound:?}"));
        if self.fail_at == Some(phase) {
            return Err(CoreError::new(HOOK_FAILED, format!("{phase} rejected")));
        }
        Ok(())
    }
}

impl Filter for Hooked {
    fn on_pre_add(&self, chain: &FilterChain, name: &str, next: &NextFilter) -> Result<(), CoreError> {
        self.hook(LifecyclePhase::PreAdd, chain, name, next)
    }

    fn on_post_add(&self, chain: &FilterChain, name: &str, next: &NextFilter) -> Result<(), CoreError> {
        self.hook(LifecyclePhase::PostAdd, chain, name, next)
    }

    fn on_pre_remove(&self, chain: &FilterChain, name: &str, next: &NextFilter) -> Result<(), CoreError> {
        self.hook(LifecyclePhase::PreRemove, chain, name, next)
    }

    fn on_post_remove(&self, chain: &FilterChain, name: &str, next: &NextFilter) -> Result<(), CoreError> {
        self.hook(LifecyclePhase::PostRemove, chain, name, next)
    }
}

/// 钩子顺序：接入前后、摘除前后；接入期间句柄与节点绑定一致。
#[test]
fn hooks_run_around_splice_and_unsplice() {
    let fx = fixture();
    let journal = Journal::default();
    let chain = fx.session.filter_chain();

    chain.add_last("codec", Hooked::new(&journal, None)).expect("add");
    chain.remove("codec").expect("remove");

    assert_eq!(
        journal.take(),
        [
            "codec:on_pre_add:None",
            "codec:on_post_add:Some(true)",
            "codec:on_pre_remove:Some(true)",
            "codec:on_post_remove:None",
        ]
    );
    assert!(chain.is_empty());
}

/// `on_post_add` 失败时节点被完整撤出。
#[test]
fn post_add_failure_rolls_back() {
    let fx = fixture();
    let journal = Journal::default();
    let chain = fx.session.filter_chain();
    chain.add_last("keep", Recording::new("keep", &journal)).expect("keep");

    let err = chain
        .add_last("broken", Hooked::new(&journal, Some(LifecyclePhase::PostAdd)))
        .expect_err("post add must fail");

    assert!(matches!(
        &err,
        ChainError::Lifecycle { phase: LifecyclePhase::PostAdd, name, .. } if name == "broken"
    ));
    assert_eq!(err.lifecycle_source().map(CoreError::code), Some(HOOK_FAILED));
    assert!(!chain.contains("broken"));
    assert_eq!(names(&fx.session), ["keep"]);

    // 回滚后名称可以再次使用。
    chain
        .add_last("broken", Recording::new("broken", &journal))
        .expect("name is free again");
}

/// `on_pre_add` 失败时节点从未接入。
#[test]
fn pre_add_failure_never_splices() {
    let fx = fixture();
    let journal = Journal::default();
    let chain = fx.session.filter_chain();

    let err = chain
        .add_first("early", Hooked::new(&journal, Some(LifecyclePhase::PreAdd)))
        .expect_err("pre add must fail");

    assert!(matches!(err, ChainError::Lifecycle { phase: LifecyclePhase::PreAdd, .. }));
    assert_eq!(journal.take(), ["early:on_pre_add:None"], "失败后不得继续调用 on_post_add");
    assert!(chain.is_empty());
}

/// 重名失败且链保持不变，新过滤器的钩子不会被调用。
#[test]
fn duplicate_name_is_rejected_without_side_effects() {
    let fx = fixture();
    let journal = Journal::default();
    let chain = fx.session.filter_chain();
    chain.add_last("a", Recording::new("a", &journal)).expect("a");
    chain.add_last("b", Recording::new("b", &journal)).expect("b");
    let before = names(&fx.session);

    let err = chain
        .add_first("b", Hooked::new(&journal, None))
        .expect_err("duplicate");

    assert!(matches!(&err, ChainError::DuplicateName { name } if name == "b"));
    assert_eq!(err.code(), codes::CHAIN_DUPLICATE_NAME);
    assert_eq!(names(&fx.session), before);
    assert!(journal.entries().is_empty());
}

#[test]
fn missing_targets_report_not_found() {
    let fx = fixture();
    let journal = Journal::default();
    let chain = fx.session.filter_chain();

    let err = chain
        .add_before("ghost", "a", Recording::new("a", &journal))
        .expect_err("anchor missing");
    assert!(matches!(&err, ChainError::FilterNotFound { target } if target == "ghost"));
    assert!(matches!(chain.remove("ghost"), Err(ChainError::FilterNotFound { .. })));
    assert!(matches!(
        chain.replace("ghost", Recording::new("x", &journal)),
        Err(ChainError::FilterNotFound { .. })
    ));
}

/// `on_pre_remove` 失败不阻止移除，`on_post_remove` 仍被调用。
#[test]
fn pre_remove_failure_still_removes() {
    let fx = fixture();
    let journal = Journal::default();
    let chain = fx.session.filter_chain();
    chain
        .add_last("sticky", Hooked::new(&journal, Some(LifecyclePhase::PreRemove)))
        .expect("add");
    journal.take();

    let err = chain.remove("sticky").err().expect("pre remove fails");

    assert!(matches!(err, ChainError::Lifecycle { phase: LifecyclePhase::PreRemove, .. }));
    assert!(!chain.contains("sticky"));
    assert_eq!(
        journal.take(),
        ["sticky:on_pre_remove:Some(true)", "sticky:on_post_remove:None"]
    );
}

/// `replace` 原地替换实例、保持位置且不触发钩子。
#[test]
fn replace_keeps_position_and_skips_hooks() {
    let fx = fixture();
    let journal = Journal::default();
    let chain = fx.session.filter_chain();
    chain.add_last("a", Recording::new("a", &journal)).expect("a");
    chain.add_last("b", Hooked::new(&journal, None)).expect("b");
    chain.add_last("c", Recording::new("c", &journal)).expect("c");
    journal.take();

    let replacement = Recording::new("b2", &journal);
    let old = chain.replace("b", Arc::clone(&replacement)).expect("replace");
    assert!(journal.entries().is_empty(), "replace 不得触发生命周期钩子");
    assert_eq!(names(&fx.session), ["a", "b", "c"]);
    assert!(chain.contains_filter(&replacement));
    assert!(!chain.contains_filter(&old));

    chain.fire_message_received(crate::support::bytes(b"m"));
    assert_eq!(journal.take(), ["a:in", "b2:in", "c:in"]);

    chain
        .replace_filter(&replacement, Hooked::new(&journal, None))
        .expect("replace by instance");
    assert!(chain.contains_type::<Hooked>());
    chain
        .replace_type::<Hooked>(Recording::new("b3", &journal))
        .expect("replace by type");
    assert!(!chain.contains_type::<Hooked>());
}

#[test]
fn remove_by_instance_and_type() {
    let fx = fixture();
    let journal = Journal::default();
    let chain = fx.session.filter_chain();
    let a = Recording::new("a", &journal);
    chain.add_last("a", Arc::clone(&a)).expect("a");
    chain.add_last("h", Hooked::new(&journal, None)).expect("h");

    let removed = chain.remove_filter(&a).expect("remove instance");
    assert!(Arc::ptr_eq(&removed, &a));
    chain.remove_type::<Hooked>().expect("remove type");
    assert!(chain.is_empty());
    assert!(matches!(chain.remove_type::<Hooked>(), Err(ChainError::FilterNotFound { .. })));
}

/// `clear` 不因单个失败中止，失败被聚合返回。
#[test]
fn clear_removes_everything_and_aggregates_failures() {
    let fx = fixture();
    let journal = Journal::default();
    let chain = fx.session.filter_chain();
    chain
        .add_last("x", Hooked::new(&journal, Some(LifecyclePhase::PreRemove)))
        .expect("x");
    chain.add_last("y", Hooked::new(&journal, None)).expect("y");
    chain
        .add_last("z", Hooked::new(&journal, Some(LifecyclePhase::PostRemove)))
        .expect("z");

    let err = chain.clear().expect_err("two hooks fail");

    assert!(chain.is_empty());
    match err {
        ChainError::Aggregate(errors) => {
            let phases: Vec<_> = errors
                .iter()
                .map(|error| match error {
                    ChainError::Lifecycle { phase, name, .. } => (name.clone(), *phase),
                    other => panic!("unexpected error: {other}"),
                })
                .collect();
            assert_eq!(
                phases,
                [
                    ("x".to_owned(), LifecyclePhase::PreRemove),
                    ("z".to_owned(), LifecyclePhase::PostRemove),
                ]
            );
        }
        other => panic!("expected aggregate, got {other:?}"),
    }
}
