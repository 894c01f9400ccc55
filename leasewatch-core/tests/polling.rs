mod support;

use std::{sync::Arc, time::Duration};

use leasewatch_config::{PollerConfig, RateLimitConfig};
use leasewatch_core::{
    poller::{ChangePoller, PartialReason, PollStatus},
    rate_limit::RateLimiter,
    store::{InMemoryLeaseStore, LeaseStore},
    time::VirtualTimeProvider,
};
use leasewatch_model::{Credential, SecretToken, Tenant, TenantId};

use support::{StubUpstream, secs, t0, tenant};

struct Fixture {
    store: InMemoryLeaseStore,
    upstream: Arc<StubUpstream>,
    clock: VirtualTimeProvider,
    poller: ChangePoller,
}

fn fixture(rate_limit: RateLimitConfig, poller: PollerConfig) -> Fixture {
    let store = InMemoryLeaseStore::new();
    let upstream = Arc::new(StubUpstream::default());
    let clock = VirtualTimeProvider::new_at(t0());
    let limiter = RateLimiter::new(Arc::new(store.clone()), Arc::new(clock.clone()), rate_limit);
    let poller = ChangePoller::new(
        Arc::new(store.clone()),
        upstream.clone(),
        limiter,
        Arc::new(clock.clone()),
        poller,
        Duration::from_secs(24 * 3600),
    );
    Fixture {
        store,
        upstream,
        clock,
        poller,
    }
}

fn credential(tenant_id: &TenantId) -> Credential {
    Credential {
        tenant_id: tenant_id.clone(),
        access_token: SecretToken::new("live"),
        refresh_token: None,
        expires_at: Some(t0() + chrono::Duration::hours(1)),
    }
}

async fn current(store: &InMemoryLeaseStore, tenant_id: &TenantId) -> Tenant {
    store.get_tenant(tenant_id).await.unwrap().unwrap()
}

#[tokio::test]
async fn cursor_advances_to_the_newest_change_and_never_back() {
    let fx = fixture(RateLimitConfig::default(), PollerConfig::default());
    let firm = tenant("firm-a");
    fx.store.insert_tenant(Tenant::new(firm.clone())).await;
    fx.upstream.push_change(&firm, "enc-1", t0() - secs(300));
    fx.upstream.push_change(&firm, "enc-2", t0() - secs(120));

    let outcome = fx
        .poller
        .poll(&current(&fx.store, &firm).await, &credential(&firm))
        .await
        .unwrap();
    assert_eq!(
        outcome.status,
        PollStatus::Complete {
            cursor: Some(t0() - secs(120))
        }
    );
    assert!(outcome.cursor_advanced);
    assert_eq!(outcome.upserts.created, 2);
    assert_eq!(current(&fx.store, &firm).await.cursor, Some(t0() - secs(120)));

    // A stale snapshot of the tenant cannot drag the cursor backwards.
    assert!(!fx.store.advance_cursor(&firm, t0() - secs(300)).await.unwrap());
    assert_eq!(current(&fx.store, &firm).await.cursor, Some(t0() - secs(120)));
}

#[tokio::test]
async fn repeated_polls_are_idempotent() {
    let fx = fixture(RateLimitConfig::default(), PollerConfig::default());
    let firm = tenant("firm-a");
    fx.store.insert_tenant(Tenant::new(firm.clone())).await;
    fx.upstream.push_change(&firm, "enc-1", t0() - secs(60));

    let stale_snapshot = current(&fx.store, &firm).await;
    fx.poller.poll(&stale_snapshot, &credential(&firm)).await.unwrap();
    fx.clock.advance(Duration::from_secs(30));

    // Same tenant snapshot (cursor unset) replays the same change.
    let replay = fx.poller.poll(&stale_snapshot, &credential(&firm)).await.unwrap();
    assert_eq!(replay.upserts.created, 0);
    assert_eq!(replay.upserts.refreshed, 1);
    assert!(!replay.cursor_advanced);
    assert_eq!(fx.store.watch_count().await, 1);

    // With the stored cursor nothing is upserted at all.
    let fresh = fx
        .poller
        .poll(&current(&fx.store, &firm).await, &credential(&firm))
        .await
        .unwrap();
    assert_eq!(fresh.upserts.total(), 0);
}

#[tokio::test]
async fn rate_limited_attempts_defer_without_moving_the_cursor() {
    let rate_limit = RateLimitConfig {
        calls_per_window: 1,
        window: Duration::from_secs(10),
        acquire_timeout: Duration::from_secs(2),
        ..RateLimitConfig::default()
    };
    let fx = fixture(rate_limit, PollerConfig::default());
    let firm = tenant("firm-a");
    fx.store.insert_tenant(Tenant::new(firm.clone())).await;
    fx.upstream.push_change(&firm, "enc-1", t0() - secs(60));

    let first = fx
        .poller
        .poll(&current(&fx.store, &firm).await, &credential(&firm))
        .await
        .unwrap();
    assert!(first.is_complete());
    let cursor_after_first = current(&fx.store, &firm).await.cursor;

    fx.upstream.push_change(&firm, "enc-2", t0() - secs(30));
    let mut deferred = 0;
    for _ in 0..2 {
        fx.clock.advance(Duration::from_secs(2));
        let attempt = fx
            .poller
            .poll(&current(&fx.store, &firm).await, &credential(&firm))
            .await
            .unwrap();
        if let PollStatus::Partial(PartialReason::RateLimited { .. }) = attempt.status {
            deferred += 1;
        }
        assert_eq!(attempt.pages, 0);
    }

    assert_eq!(deferred, 2);
    assert_eq!(fx.upstream.change_calls(&firm), 1);
    assert_eq!(current(&fx.store, &firm).await.cursor, cursor_after_first);

    // The next window picks up the pending change.
    fx.clock.set_utc(t0() + secs(10));
    let next = fx
        .poller
        .poll(&current(&fx.store, &firm).await, &credential(&firm))
        .await
        .unwrap();
    assert!(next.is_complete());
    assert_eq!(current(&fx.store, &firm).await.cursor, Some(t0() - secs(30)));
}

#[tokio::test]
async fn page_cap_checkpoints_the_cursor_and_resumes_next_cycle() {
    let poller = PollerConfig {
        page_size: 2,
        max_pages: 2,
    };
    let fx = fixture(RateLimitConfig::default(), poller);
    let firm = tenant("firm-a");
    fx.store.insert_tenant(Tenant::new(firm.clone())).await;
    for n in 0..5 {
        fx.upstream
            .push_change(&firm, &format!("enc-{n}"), t0() - secs(100 - n));
    }

    let outcome = fx
        .poller
        .poll(&current(&fx.store, &firm).await, &credential(&firm))
        .await
        .unwrap();
    assert_eq!(outcome.status, PollStatus::Partial(PartialReason::PageCap));
    assert_eq!(outcome.pages, 2);
    assert_eq!(outcome.upserts.created, 4);
    assert!(outcome.cursor_advanced);
    // Just below the last item of the second page, so its ties are re-read.
    assert_eq!(
        current(&fx.store, &firm).await.cursor,
        Some(t0() - secs(97) - chrono::Duration::microseconds(1))
    );

    let resumed = fx
        .poller
        .poll(&current(&fx.store, &firm).await, &credential(&firm))
        .await
        .unwrap();
    assert_eq!(
        resumed.status,
        PollStatus::Complete {
            cursor: Some(t0() - secs(96))
        }
    );
    assert_eq!(resumed.upserts.created, 1);
    assert_eq!(resumed.upserts.refreshed, 1);
    assert_eq!(fx.store.watch_count().await, 5);
    assert_eq!(current(&fx.store, &firm).await.cursor, Some(t0() - secs(96)));
}

#[tokio::test]
async fn backlog_beyond_one_window_drains_across_cycles() {
    let poller = PollerConfig {
        page_size: 2,
        ..PollerConfig::default()
    };
    let fx = fixture(RateLimitConfig::default(), poller);
    let firm = tenant("firm-a");
    fx.store.insert_tenant(Tenant::new(firm.clone())).await;
    for n in 0..30 {
        fx.upstream
            .push_change(&firm, &format!("enc-{n:02}"), t0() - secs(600 - n));
    }

    let first = fx
        .poller
        .poll(&current(&fx.store, &firm).await, &credential(&firm))
        .await
        .unwrap();
    assert!(matches!(
        first.status,
        PollStatus::Partial(PartialReason::RateLimited { .. })
    ));
    assert_eq!(first.pages, 10);
    assert!(first.cursor_advanced);
    assert_eq!(fx.store.watch_count().await, 20);

    let mut cycles = 1;
    loop {
        fx.clock.advance(Duration::from_secs(10));
        let outcome = fx
            .poller
            .poll(&current(&fx.store, &firm).await, &credential(&firm))
            .await
            .unwrap();
        cycles += 1;
        if outcome.is_complete() {
            break;
        }
        assert!(cycles < 5, "backlog never drained");
    }

    assert_eq!(cycles, 2);
    assert_eq!(fx.store.watch_count().await, 30);
    assert_eq!(current(&fx.store, &firm).await.cursor, Some(t0() - secs(571)));
}

#[tokio::test]
async fn failed_page_keeps_the_previous_checkpoint() {
    let poller = PollerConfig {
        page_size: 2,
        max_pages: 1,
    };
    let fx = fixture(RateLimitConfig::default(), poller);
    let firm = tenant("firm-a");
    fx.store.insert_tenant(Tenant::new(firm.clone())).await;
    for n in 0..4 {
        fx.upstream
            .push_change(&firm, &format!("enc-{n}"), t0() - secs(100 - n));
    }

    fx.poller
        .poll(&current(&fx.store, &firm).await, &credential(&firm))
        .await
        .unwrap();
    let checkpoint = current(&fx.store, &firm).await.cursor;
    assert_eq!(
        checkpoint,
        Some(t0() - secs(99) - chrono::Duration::microseconds(1))
    );

    fx.upstream.reject(&firm);
    let err = fx
        .poller
        .poll(&current(&fx.store, &firm).await, &credential(&firm))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "credential");
    assert_eq!(current(&fx.store, &firm).await.cursor, checkpoint);
}

#[tokio::test]
async fn rejected_tokens_surface_as_credential_errors() {
    let fx = fixture(RateLimitConfig::default(), PollerConfig::default());
    let firm = tenant("firm-a");
    fx.store.insert_tenant(Tenant::new(firm.clone())).await;
    fx.upstream.push_change(&firm, "enc-1", t0() - secs(60));
    fx.upstream.reject(&firm);

    let err = fx
        .poller
        .poll(&current(&fx.store, &firm).await, &credential(&firm))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "credential");
    assert_eq!(current(&fx.store, &firm).await.cursor, None);
    assert_eq!(fx.store.watch_count().await, 0);
}
