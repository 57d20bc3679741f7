//! End-to-end scenario tests against the scripted mock driver.
//!
//! Every run goes through the public API only: build or load a scenario,
//! hand the runner a driver factory, inspect the report and the driver's
//! call journal.

use std::time::Duration;

use proptest::prelude::*;
use spa_probe::prelude::*;
use spa_probe::{MockFailures, StepOutcome, VerificationEngine};
use tokio::time::Instant;

const BASE: &str = "http://localhost:3000";

fn runner_for(driver: &MockDriver) -> ScenarioRunner<impl spa_probe::DriverFactory<Driver = MockDriver>> {
    let driver = driver.clone();
    ScenarioRunner::new(move || driver.clone())
}

fn dashboard() -> MockPage {
    MockPage::new().with_text("User Dashboard")
}

fn assert_released_once(driver: &MockDriver) {
    assert_eq!(driver.count("start"), 1, "journal: {:?}", driver.journal());
    assert_eq!(driver.count("launch:"), 1);
    assert_eq!(driver.count("close:context"), 1);
    assert_eq!(driver.count("close:browser"), 1);
    assert_eq!(driver.count("stop"), 1);
    assert_eq!(driver.open_handles(), 0);
}

// === Session lifecycle ===

mod lifecycle {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn released_once_on_pass() {
        let driver = MockDriver::new().with_route(format!("{BASE}/dashboard"), dashboard());
        let scenario = Scenario::builder("pass")
            .navigate(NavigationStep::goto(format!("{BASE}/dashboard")))
            .assertion(Assertion::visible_text("User Dashboard"))
            .build()
            .unwrap();

        let report = runner_for(&driver).run(&scenario).await.unwrap();
        assert!(report.is_pass());
        assert_released_once(&driver);
    }

    #[tokio::test(start_paused = true)]
    async fn released_once_on_assertion_failure() {
        let driver = MockDriver::new().with_route(format!("{BASE}/login"), MockPage::new());
        let scenario = Scenario::builder("miss")
            .navigate(NavigationStep::goto(format!("{BASE}/login")))
            .assertion(Assertion::visible_text("User Dashboard"))
            .build()
            .unwrap();

        let report = runner_for(&driver).run(&scenario).await.unwrap();
        assert_eq!(report.verdict.label(), "assertion-failure");
        assert_released_once(&driver);
    }

    #[tokio::test(start_paused = true)]
    async fn released_once_on_interaction_failure() {
        let driver = MockDriver::new().with_route(format!("{BASE}/login"), MockPage::new());
        let scenario = Scenario::builder("broken")
            .navigate(NavigationStep::goto(format!("{BASE}/login")))
            .interact(InteractionStep::click(Selector::text("Sign in")).with_timeout(1000))
            .assertion(Assertion::visible_text("User Dashboard"))
            .build()
            .unwrap();

        let report = runner_for(&driver).run(&scenario).await.unwrap();
        assert!(!report.is_pass());
        assert_released_once(&driver);
    }

    #[tokio::test(start_paused = true)]
    async fn released_once_after_browser_crash() {
        let crash_url = format!("{BASE}/crash");
        let driver = MockDriver::new().with_failures(MockFailures {
            disconnect_on: Some(crash_url.clone()),
            ..MockFailures::default()
        });
        let scenario = Scenario::builder("crash")
            .navigate(NavigationStep::goto(crash_url))
            .navigate(NavigationStep::goto(format!("{BASE}/")))
            .assertion(Assertion::visible_text("User Dashboard"))
            .build()
            .unwrap();

        let report = runner_for(&driver).run(&scenario).await.unwrap();
        assert!(report.verdict.is_environment_failure());
        assert_eq!(driver.visited(), vec![format!("{BASE}/crash")]);
        assert_released_once(&driver);
    }

    #[tokio::test(start_paused = true)]
    async fn released_once_after_deadline() {
        let driver = MockDriver::new().with_route(
            format!("{BASE}/"),
            MockPage::new().with_load_hang(),
        );
        let scenario = Scenario::builder("deadline")
            .timeout_ms(4000)
            .navigate(NavigationStep::goto(format!("{BASE}/")))
            .navigate(NavigationStep::goto(format!("{BASE}/")))
            .assertion(Assertion::visible_text("never"))
            .build()
            .unwrap();

        let started = Instant::now();
        let report = runner_for(&driver).run(&scenario).await.unwrap();
        assert!(report.verdict.is_environment_failure());
        assert!(report.verdict.reason().unwrap().contains("deadline"));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_released_once(&driver);
    }

    #[tokio::test(start_paused = true)]
    async fn acquisition_failure_tears_down_partial_session() {
        let driver = MockDriver::new().with_failures(MockFailures {
            new_page: true,
            ..MockFailures::default()
        });
        let scenario = Scenario::builder("no-page")
            .assertion(Assertion::visible_text("User Dashboard"))
            .build()
            .unwrap();

        let report = runner_for(&driver).run(&scenario).await.unwrap();
        assert!(report.verdict.is_environment_failure());
        assert!(report.session_id.is_none());
        assert_eq!(driver.count("close:context"), 1);
        assert_eq!(driver.count("close:browser"), 1);
        assert_eq!(driver.count("stop"), 1);
        assert_eq!(driver.open_handles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn release_failure_is_surfaced() {
        let driver = MockDriver::new()
            .with_route(format!("{BASE}/"), dashboard())
            .with_failures(MockFailures {
                close_context: true,
                ..MockFailures::default()
            });
        let scenario = Scenario::builder("leak")
            .navigate(NavigationStep::goto(format!("{BASE}/")))
            .assertion(Assertion::visible_text("User Dashboard"))
            .build()
            .unwrap();

        match runner_for(&driver).run(&scenario).await {
            Err(ProbeError::ResourceReleaseFailure { handles, .. }) => {
                assert!(handles.contains("context"));
            }
            other => panic!("expected release failure, got {other:?}"),
        }
        assert_eq!(driver.count("close:browser"), 1);
        assert_eq!(driver.count("stop"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_runs_use_separate_sessions() {
        let first = MockDriver::new().with_route(format!("{BASE}/"), dashboard());
        let second = MockDriver::new().with_route(format!("{BASE}/"), dashboard());
        let scenario = Scenario::builder("twin")
            .navigate(NavigationStep::goto(format!("{BASE}/")))
            .assertion(Assertion::visible_text("User Dashboard"))
            .build()
            .unwrap();

        let (runner_a, runner_b) = (runner_for(&first), runner_for(&second));
        let (a, b) = tokio::join!(runner_a.run(&scenario), runner_b.run(&scenario));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.is_pass() && b.is_pass());
        assert_ne!(a.session_id, b.session_id);
        assert_released_once(&first);
        assert_released_once(&second);
    }
}

// === Navigation ladder ===

mod ladder {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn standard_ladder_visits_every_step_after_success() {
        let driver = MockDriver::new()
            .with_route(format!("{BASE}/dashboard"), dashboard())
            .with_route(format!("{BASE}/"), dashboard())
            .with_route(format!("{BASE}/?_r=1"), dashboard())
            .with_route("http://127.0.0.1:3000/dashboard", dashboard())
            .with_route("http://127.0.0.1:3000/dashboard?_r=2", dashboard());
        let scenario = Scenario::builder("ladder")
            .ladder(FallbackLadder::standard(BASE, "/dashboard"))
            .assertion(Assertion::visible_text("User Dashboard"))
            .build()
            .unwrap();

        let report = runner_for(&driver).run(&scenario).await.unwrap();
        assert!(report.is_pass());
        assert_eq!(
            driver.visited(),
            vec![
                format!("{BASE}/dashboard"),
                format!("{BASE}/"),
                format!("{BASE}/?_r=1"),
                "http://127.0.0.1:3000/dashboard".to_string(),
                "http://127.0.0.1:3000/dashboard?_r=2".to_string(),
            ]
        );
        assert_eq!(report.navigation.committed(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_targets_are_absorbed() {
        let driver = MockDriver::new().with_route("http://127.0.0.1:3000/dashboard", dashboard());
        let scenario = Scenario::builder("loopback-rescue")
            .ladder(FallbackLadder::standard(BASE, "dashboard"))
            .assertion(Assertion::visible_text("User Dashboard"))
            .build()
            .unwrap();

        let report = runner_for(&driver).run(&scenario).await.unwrap();
        assert_eq!(report.navigation.len(), 5);
        assert!(matches!(report.navigation.steps[0].outcome, StepOutcome::Failed(_)));
        assert_eq!(report.navigation.steps[3].outcome, StepOutcome::Committed);
        // the last step lands on an unrouted cache-busted URL
        assert!(!report.is_pass());
    }

    #[tokio::test(start_paused = true)]
    async fn error_page_reload_control_recovers() {
        let driver = MockDriver::new()
            .with_route(format!("{BASE}/dashboard"), dashboard())
            .with_error_page(
                MockPage::new().on_click(Selector::css("#reload-button"), format!("{BASE}/dashboard")),
            );
        let scenario = Scenario::builder("reload-control")
            .ladder(
                FallbackLadder::new()
                    .then(NavigationStep::goto(format!("{BASE}/down")))
                    .with_reload_control(Selector::css("#reload-button")),
            )
            .assertion(Assertion::visible_text("User Dashboard"))
            .build()
            .unwrap();

        let report = runner_for(&driver).run(&scenario).await.unwrap();
        assert!(report.is_pass(), "{}", report.verdict);
        assert_eq!(
            report.navigation.descriptions(),
            vec![format!("goto {BASE}/down").as_str(), "click reload control"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn load_state_timeouts_are_tolerated() {
        let driver = MockDriver::new().with_route(
            format!("{BASE}/"),
            dashboard().with_load_hang().with_frames(2),
        );
        let scenario = Scenario::builder("hang")
            .navigate(NavigationStep::goto(format!("{BASE}/")))
            .assertion(Assertion::visible_text("User Dashboard"))
            .build()
            .unwrap();

        let report = runner_for(&driver).run(&scenario).await.unwrap();
        assert!(report.is_pass(), "{}", report.verdict);
        let settle = report.navigation.steps[0].settle.as_ref().unwrap();
        assert!(settle.timeouts() >= 1);
        assert!(!settle.is_fully_settled());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_ladder_runs_in_declared_order(
            routes in prop::collection::vec(("[a-z]{1,8}", any::<bool>()), 1..6)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            let mut driver = MockDriver::new();
            let mut scenario = Scenario::builder("prop");
            let mut expected = Vec::new();
            for (path, routed) in &routes {
                let url = format!("{BASE}/{path}");
                if *routed {
                    driver = driver.with_route(url.clone(), dashboard());
                }
                scenario = scenario.navigate(NavigationStep::goto(url.clone()).with_settle(0));
                expected.push(url);
            }
            let scenario = scenario
                .assertion(Assertion::visible_text("User Dashboard").with_timeout(100))
                .build()
                .unwrap();

            let report = rt.block_on(runner_for(&driver).run(&scenario)).unwrap();
            prop_assert_eq!(driver.visited(), expected);
            prop_assert_eq!(report.navigation.len(), routes.len());
            let last = routes.last().map(|(path, _)| path);
            let lands_on_route = routes.iter().any(|(path, routed)| *routed && Some(path) == last);
            prop_assert_eq!(report.is_pass(), lands_on_route);
            prop_assert_eq!(driver.count("stop"), 1);
        }
    }
}

// === Interactions ===

mod interactions {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn login_click_reaches_dashboard() {
        let driver = MockDriver::new()
            .with_route(
                format!("{BASE}/login"),
                MockPage::new()
                    .with_element(Selector::css("#email"))
                    .on_click(Selector::text("Sign in"), format!("{BASE}/dashboard"))
                    .with_text("Sign in"),
            )
            .with_route(format!("{BASE}/dashboard"), dashboard());
        let scenario = Scenario::builder("TC001_User_Login_Success")
            .navigate(NavigationStep::goto(format!("{BASE}/login")))
            .interact(InteractionStep::fill(Selector::css("#email"), "user@example.com"))
            .interact(InteractionStep::click(Selector::text("Sign in")).with_pre_wait(3000))
            .assertion(Assertion::visible_text("User Dashboard"))
            .build()
            .unwrap();

        let report = runner_for(&driver).run(&scenario).await.unwrap();
        assert!(report.is_pass(), "{}", report.verdict);
        assert_eq!(report.interactions_completed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_aborts_remaining_interactions_and_verification() {
        let driver = MockDriver::new().with_route(
            format!("{BASE}/login"),
            MockPage::new().with_text("Sign in").with_element(Selector::css("#email")),
        );
        let scenario = Scenario::builder("abort")
            .navigate(NavigationStep::goto(format!("{BASE}/login")))
            .interact(InteractionStep::fill(Selector::css("#email"), "a@b.c"))
            .interact(InteractionStep::click(Selector::xpath("//button[@id='missing']")).with_timeout(500))
            .interact(InteractionStep::click(Selector::text("Sign in")))
            .assertion(Assertion::visible_text("Sign in"))
            .build()
            .unwrap();

        let report = runner_for(&driver).run(&scenario).await.unwrap();
        assert_eq!(report.verdict.label(), "assertion-failure");
        assert!(report.verdict.reason().unwrap().contains("interaction 1"));
        assert_eq!(report.interactions_completed, 1);
        assert!(!driver.was_called("click:text=Sign in"));
        assert!(!driver.was_called("is_visible:"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_click_target_never_passes() {
        let driver = MockDriver::new().with_route(format!("{BASE}/"), dashboard());
        let scenario = Scenario::builder("missing")
            .navigate(NavigationStep::goto(format!("{BASE}/")))
            .interact(InteractionStep::click(Selector::css("#logout")).with_timeout(1000))
            .assertion(Assertion::visible_text("User Dashboard"))
            .build()
            .unwrap();

        let report = runner_for(&driver).run(&scenario).await.unwrap();
        assert!(!report.is_pass());
    }

    #[tokio::test(start_paused = true)]
    async fn assertion_runs_on_tab_opened_by_click() {
        let driver = MockDriver::new()
            .with_route(
                format!("{BASE}/login"),
                MockPage::new()
                    .with_text("Open report")
                    .on_click_opens_tab(Selector::text("Open report"), format!("{BASE}/report")),
            )
            .with_route(format!("{BASE}/report"), MockPage::new().with_text("Quarterly Report"));
        let scenario = Scenario::builder("report_tab")
            .navigate(NavigationStep::goto(format!("{BASE}/login")))
            .interact(InteractionStep::click(Selector::text("Open report")))
            .assertion(Assertion::visible_text("Quarterly Report"))
            .build()
            .unwrap();

        let report = runner_for(&driver).run(&scenario).await.unwrap();
        assert!(report.is_pass(), "{}", report.verdict);
        assert!(driver.was_called(&format!("open_tab:{BASE}/report")));
        assert_released_once(&driver);
    }
}

// === Verification ===

mod verification {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn round_trip_pass_then_assertion_failure() {
        let url = format!("{BASE}/home");
        let driver = MockDriver::new().with_route(url.clone(), dashboard());
        let scenario = Scenario::builder("round-trip")
            .navigate(NavigationStep::goto(url.clone()))
            .assertion(Assertion::visible_text("User Dashboard"))
            .build()
            .unwrap();

        let report = runner_for(&driver).run(&scenario).await.unwrap();
        assert_eq!(report.verdict, Verdict::Pass);

        driver.set_route(url, MockPage::new().with_text("Welcome back"));
        let report = runner_for(&driver).run(&scenario).await.unwrap();
        match &report.verdict {
            Verdict::AssertionFailure(reason) => assert!(reason.contains("User Dashboard")),
            other => panic!("unexpected verdict: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dashboard_example_reports_description() {
        let driver = MockDriver::new()
            .with_route(format!("{BASE}/dashboard"), MockPage::new().with_text("Loading"))
            .with_route(format!("{BASE}/login"), MockPage::new().with_text("Sign in"))
            .with_route(format!("{BASE}/"), MockPage::new().with_text("Welcome"));
        let scenario = Scenario::builder("TC002_Dashboard")
            .navigate(NavigationStep::goto(format!("{BASE}/dashboard")))
            .navigate(NavigationStep::goto(format!("{BASE}/login")))
            .navigate(NavigationStep::goto(format!("{BASE}/")))
            .assertion(
                Assertion::visible_text("User Dashboard")
                    .with_timeout(3000)
                    .with_description("expected authenticated redirect to dashboard"),
            )
            .build()
            .unwrap();

        let report = runner_for(&driver).run(&scenario).await.unwrap();
        assert_eq!(
            report.verdict,
            Verdict::AssertionFailure(
                "expected authenticated redirect to dashboard; not observed".to_string()
            )
        );
    }

    #[tokio::test(start_paused = true)]
    async fn verify_respects_deadline() {
        let driver = MockDriver::new().with_route(format!("{BASE}/"), MockPage::new());
        let mut session = SessionManager::default().acquire(driver.clone()).await.unwrap();
        let page = session.initial_page();
        session
            .driver_mut()
            .goto(page, &format!("{BASE}/"), WaitUntil::Commit, Duration::from_secs(10))
            .await
            .unwrap();

        let engine = VerificationEngine::default();
        let started = Instant::now();
        let verdict = engine
            .verify(
                session.driver(),
                page,
                &Assertion::visible_text("User Dashboard").with_timeout(2000),
            )
            .await;
        assert_eq!(verdict.label(), "assertion-failure");
        assert!(started.elapsed() <= Duration::from_millis(2000));
        session.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn late_render_within_deadline_passes() {
        let driver = MockDriver::new().with_route(
            format!("{BASE}/"),
            dashboard().revealed_after(Duration::from_millis(1500)),
        );
        let scenario = Scenario::builder("late")
            .navigate(NavigationStep::goto(format!("{BASE}/")).with_settle(0))
            .assertion(Assertion::visible_text("User Dashboard").with_timeout(3000))
            .build()
            .unwrap();

        let report = runner_for(&driver).run(&scenario).await.unwrap();
        assert!(report.is_pass());
    }
}

// === Scenario files ===

mod files {
    use super::*;
    use std::io::Write;

    #[tokio::test(start_paused = true)]
    async fn yaml_scenario_runs_end_to_end() {
        let yaml = format!(
            r#"
id: TC003_From_File
navigation:
  - action: goto
    url: {BASE}/dashboard
    settle_ms: 0
interactions:
  - locator: "text=Refresh"
assertion:
  visible_text: User Dashboard
  timeout_ms: 1000
"#
        );
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let driver = MockDriver::new()
            .with_route(format!("{BASE}/dashboard"), dashboard().with_text("Refresh"));
        let scenario = Scenario::load(file.path()).unwrap();
        let report = runner_for(&driver).run(&scenario).await.unwrap();

        assert!(report.is_pass(), "{}", report.verdict);
        assert_eq!(report.scenario_id, "TC003_From_File");
        assert!(driver.was_called("click:text=Refresh"));
    }

    #[test]
    fn runner_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "settle_timeout_ms: 1500\npoll_interval_ms: 50").unwrap();

        let config = RunnerConfig::load(file.path()).unwrap();
        assert_eq!(config.settle_timeout_ms, 1500);
        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.settle_state, LoadState::DomContentLoaded);
    }
}
