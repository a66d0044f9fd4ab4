mod common;

use common::*;
use portal_rpa::{Challenge, ChallengeSolver, PollingSolver, RpaError};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn never_ready_job_times_out_at_the_ceiling() {
    let provider = Arc::new(CountingProvider::never_ready());
    let solver = PollingSolver::new(
        SharedProvider(provider.clone()),
        Duration::from_secs(5),
        Duration::from_secs(180),
    );

    let started = Instant::now();
    let err = solver
        .solve(&Challenge::recaptcha_v2(SITE_KEY), LOGIN_URL)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RpaError::ProviderTimeout {
            provider: "counting",
            waited_secs: 180
        }
    ));
    assert!(started.elapsed() <= Duration::from_secs(180) + Duration::from_secs(5));
    assert_eq!(provider.submits.load(Ordering::SeqCst), 1);
    assert!(provider.polls.load(Ordering::SeqCst) >= 30);
}

#[tokio::test(start_paused = true)]
async fn ready_job_reports_elapsed_time_and_default_cost() {
    let provider = Arc::new(CountingProvider::ready_after(3));
    let solver = PollingSolver::new(
        SharedProvider(provider.clone()),
        Duration::from_secs(5),
        Duration::from_secs(180),
    );

    let solution = solver
        .solve(&Challenge::recaptcha_v2(SITE_KEY), LOGIN_URL)
        .await
        .unwrap();

    assert_eq!(solution.token, "03AGdBq-solved-token");
    assert_eq!(solution.provider, "counting");
    assert!((solution.cost - 0.003).abs() < f64::EPSILON);
    assert!(solution.solve_time >= Duration::from_secs(15));
    assert_eq!(provider.polls.load(Ordering::SeqCst), 3);
}
