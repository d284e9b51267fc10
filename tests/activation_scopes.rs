mod support;

use shardkit_rs::{Bindings, Category};
use std::panic::{catch_unwind, AssertUnwindSafe};
use support::two_server_fixture;

const ANALYTICS: Category = Category::new("analytics");

#[test]
fn nested_activations_restore_in_order() {
    let fx = two_server_fixture();
    let mut ctx = fx.context();
    let (ten, twenty, thirty) = (fx.shard(10), fx.shard(20), fx.shard(30));

    let existing = ctx.activate_unscoped(&Bindings::primary(thirty.clone()));
    ctx.activate(&Bindings::primary(ten.clone()), |ctx| {
        assert_eq!(ctx.current_shard(), ten);
        ctx.activate(&Bindings::primary(twenty.clone()), |ctx| {
            assert_eq!(ctx.current_shard(), twenty);
        });
        assert_eq!(ctx.current_shard(), ten);
    });
    assert_eq!(ctx.current_shard(), thirty);
    ctx.release(existing);
    assert_eq!(ctx.current_shard(), ten);
    assert!(ctx.stack().is_empty());
}

#[test]
fn errors_and_panics_unwind_the_stack() {
    let fx = two_server_fixture();
    let mut ctx = fx.context();
    let twenty = fx.shard(20);

    let result: anyhow::Result<()> = ctx.activate(&Bindings::primary(twenty.clone()), |_| {
        anyhow::bail!("query failed")
    });
    assert!(result.is_err());
    assert!(ctx.stack().is_empty());

    let panicked = catch_unwind(AssertUnwindSafe(|| {
        ctx.activate(&Bindings::primary(twenty.clone()), |_| panic!("driver crashed"))
    }));
    assert!(panicked.is_err());
    assert!(ctx.stack().is_empty());
    assert_eq!(ctx.current_shard(), fx.shard(10));
}

#[test]
fn categories_are_independent() -> anyhow::Result<()> {
    let fx = two_server_fixture();
    let mut ctx = fx.context();
    let (twenty, thirty) = (fx.shard(20), fx.shard(30));

    let bindings = Bindings::new()
        .bind(Category::PRIMARY, twenty.clone())
        .bind(ANALYTICS, thirty.clone());
    ctx.activate(&bindings, |ctx| -> anyhow::Result<()> {
        assert_eq!(ctx.current(Category::PRIMARY), twenty);
        assert_eq!(ctx.current(ANALYTICS), thirty);
        assert_eq!(ctx.current_shards().len(), 2);

        let handle = ctx.connection(ANALYTICS)?;
        assert_eq!(handle.database, "shard_30");
        Ok(())
    })?;
    assert_eq!(ctx.current(ANALYTICS), fx.shard(10));
    Ok(())
}

#[test]
fn reactivating_the_current_shard_pushes_nothing() {
    let fx = two_server_fixture();
    let mut ctx = fx.context();
    let ten = fx.shard(10);

    let guard = ctx.activate_scoped(&Bindings::primary(ten));
    assert_eq!(guard.pushed(), 0);
    drop(guard);

    let guard = ctx.activate_scoped(&Bindings::primary(fx.shard(20)));
    assert_eq!(guard.pushed(), 1);
    assert_eq!(guard.stack().depth(Category::PRIMARY), 1);
}

#[test]
fn unscoped_frames_stay_until_released() {
    let fx = two_server_fixture();
    let mut ctx = fx.context();
    let frames = ctx.activate_unscoped(&Bindings::primary(fx.shard(30)));
    assert_eq!(ctx.current_shard(), fx.shard(30));
    ctx.release(frames);
    assert_eq!(ctx.current_shard(), fx.shard(10));
}

#[test]
fn contexts_on_other_threads_start_empty() {
    let fx = two_server_fixture();
    let mut ctx = fx.context();
    let sharding = fx.sharding.clone();
    let twenty = fx.shard(20);

    ctx.activate(&Bindings::primary(twenty.clone()), |ctx| {
        let seen = std::thread::spawn(move || sharding.context().current_shard())
            .join()
            .unwrap();
        assert_eq!(seen.id(), fx.shard(10).id());
        assert_eq!(ctx.current_shard(), twenty);
    });
}
