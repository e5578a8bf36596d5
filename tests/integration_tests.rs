mod common;

use common::*;
use pvgate::api;
use pvgate::boost::BoostAction;
use pvgate::gateway::INTENT_QUEUE_SIZE;
use pvgate::relay_plus::RelayPlusAction;
use pvgate::stats::{EnergyIndex, StatField};
use pvgate::telemetry::{topics, ResetReason};
use pvgate::*;
use std::time::Duration;

fn gateway_with(config: &GatewayConfig, clock: &ManualClock, controller: &MockController) -> Gateway {
    Gateway::new(config, clock.shared(), controller.boxed())
}

#[test]
fn test_first_tick_loads_statistics_and_parameters() {
    let clock = clock_at(12, 0);
    let controller = MockController::new(&clock);
    let mut gateway = gateway_with(&test_config(), &clock, &controller);

    let report = gateway.tick();
    assert!(report.polled);
    assert!(report.poll_error.is_none());
    assert!(report.history_sampled);

    assert_eq!(gateway.stats().map(StatisticsVector::v_rms), Some(231.5));
    assert_eq!(gateway.params().map(ParameterVector::version), Some(FIRMWARE_VERSION));
    assert_eq!(gateway.history().len(), 1);

    let snapshot = gateway.handle().snapshot();
    assert!(snapshot.stats.is_some());
    assert!(snapshot.params.is_some());
    assert_eq!(snapshot.state.polls_ok, 1);
    assert_eq!(snapshot.history.len(), 1);
}

#[test]
fn test_parameters_not_reloaded_every_poll() {
    let clock = clock_at(12, 0);
    let controller = MockController::new(&clock);
    let mut gateway = gateway_with(&test_config(), &clock, &controller);

    for _ in 0..5 {
        gateway.tick();
        clock.advance(Duration::from_secs(1));
    }
    assert_eq!(controller.requests_with_tag("STATS").len(), 5);
    assert_eq!(controller.requests_with_tag("PARAM").len(), 1);

    // A firmware version change invalidates the cached parameters.
    controller.set_stat(StatField::Version, 3.4);
    gateway.tick();
    assert_eq!(controller.requests_with_tag("PARAM").len(), 2);
}

#[test]
fn test_intents_applied_by_the_loop() {
    let clock = clock_at(12, 0);
    let controller = MockController::new(&clock);
    let mut gateway = gateway_with(&test_config(), &clock, &controller);
    let handle = gateway.handle();
    gateway.tick();

    handle
        .submit(Intent::WriteParameter {
            field: ParamField::PMargin,
            value: 40.0,
        })
        .unwrap();
    handle.submit(Intent::SetRelayMode(RoutingMode::Forced)).unwrap();
    handle.submit(Intent::SaveControllerConfig).unwrap();
    let report = gateway.tick();

    assert_eq!(report.intents_applied, 3);
    assert_eq!(controller.state().params[ParamField::PMargin.index()], 40.0);
    assert_eq!(gateway.params().map(|p| p.get(ParamField::PMargin)), Some(40.0));
    assert_eq!(controller.relay_mode(), Some(RoutingMode::Forced));
    assert_eq!(controller.state().saved, 1);

    clock.advance(Duration::from_secs(1));
    gateway.tick();
    assert!(gateway.stats().is_some_and(StatisticsVector::relay_on));
}

#[test]
fn test_failed_intent_recorded() {
    let clock = clock_at(12, 0);
    let controller = MockController::new(&clock);
    let mut gateway = gateway_with(&test_config(), &clock, &controller);
    let handle = gateway.handle();
    gateway.tick();

    controller.set_behaviour(Behaviour::RejectWrites);
    handle.submit(Intent::SetTriacMode(RoutingMode::Stop)).unwrap();
    let report = gateway.tick();
    assert_eq!(report.intents_applied, 0);
    assert_eq!(gateway.state().intents_failed, 1);
    assert!(gateway.state().last_error.is_some());
}

#[test]
fn test_intent_queue_is_bounded() {
    let clock = clock_at(12, 0);
    let controller = MockController::new(&clock);
    let gateway = gateway_with(&test_config(), &clock, &controller);
    let handle = gateway.handle();

    for _ in 0..INTENT_QUEUE_SIZE {
        handle.submit(Intent::ClearHistory).unwrap();
    }
    assert!(matches!(
        handle.submit(Intent::ClearHistory),
        Err(GatewayError::QueueFull)
    ));
}

#[test]
fn test_boost_command_follows_scheduler() {
    let clock = clock_at(12, 0);
    let controller = MockController::new(&clock);
    let mut config = test_config();
    config.boost.duration_min = 30;
    let mut gateway = gateway_with(&config, &clock, &controller);
    let handle = gateway.handle();
    gateway.tick();

    handle.submit(Intent::Boost { on: true }).unwrap();
    gateway.tick();
    assert!(gateway.boost().is_active());
    assert_eq!(controller.state().boost_ratio, Some(100));

    clock.advance(Duration::from_secs(30 * 60));
    let report = gateway.tick();
    assert_eq!(report.boost, Some(BoostAction::Stop));
    assert!(!gateway.boost().is_active());
    assert_eq!(controller.state().boost_ratio, None);
}

#[test]
fn test_boost_command_retried_after_link_failure() {
    let clock = clock_at(12, 0);
    let controller = MockController::new(&clock);
    let mut gateway = gateway_with(&test_config(), &clock, &controller);
    let handle = gateway.handle();
    gateway.tick();

    controller.set_behaviour(Behaviour::Silent);
    handle.submit(Intent::Boost { on: true }).unwrap();
    gateway.tick();
    assert!(gateway.boost().is_active());
    assert_eq!(controller.state().boost_ratio, None);

    controller.set_behaviour(Behaviour::Normal);
    clock.advance(Duration::from_secs(1));
    gateway.tick();
    assert_eq!(controller.state().boost_ratio, Some(100));
}

#[test]
fn test_daily_counters_roll_over_once_per_day() {
    let clock = clock_at(12, 0);
    let controller = MockController::new(&clock);
    let mut config = test_config();
    config.serial.poll_ms = 5000;
    let mut gateway = gateway_with(&config, &clock, &controller);
    gateway.tick();

    let polls_per_day = 24 * 3600 / 5;
    let mut rollovers = 0;
    for _ in 0..polls_per_day {
        clock.advance(Duration::from_secs(5));
        controller.add_energy(EnergyIndex::Routed, 1.0);
        controller.add_energy(EnergyIndex::Import, 0.5);
        let report = gateway.tick();
        assert!(report.polled);
        if report.day_rolled {
            rollovers += 1;
        }
    }
    assert_eq!(rollovers, 1);
    assert_eq!(gateway.state().day_rollovers, 1);

    // Midnight poll captured the start of day; noon is twelve hours later.
    let stats = gateway.stats().unwrap();
    let polls_since_midnight = f64::from(12 * 3600 / 5);
    assert_eq!(stats.daily_delta(EnergyIndex::Routed), polls_since_midnight);
    assert_eq!(stats.daily_delta(EnergyIndex::Import), polls_since_midnight * 0.5);
    assert_eq!(stats.indices().routed, f64::from(polls_per_day));

    // One point every 30 minutes over 24 hours, both ends included.
    assert_eq!(gateway.history().len(), 49);
}

#[test]
fn test_reset_indices_recaptures_day_start() {
    let clock = clock_at(12, 0);
    let controller = MockController::new(&clock);
    controller.add_energy(EnergyIndex::Routed, 500.0);
    let mut gateway = gateway_with(&test_config(), &clock, &controller);
    let handle = gateway.handle();
    gateway.tick();

    handle.submit(Intent::ResetIndices).unwrap();
    gateway.tick();
    // The first poll after the reset captures a new start of day.
    clock.advance(Duration::from_secs(1));
    gateway.tick();
    clock.advance(Duration::from_secs(1));
    controller.add_energy(EnergyIndex::Routed, 3.0);
    gateway.tick();

    let stats = gateway.stats().unwrap();
    assert_eq!(stats.indices().routed, 3.0);
    assert_eq!(stats.daily_delta(EnergyIndex::Routed), 3.0);
    assert_eq!(gateway.state().day_rollovers, 0);
}

#[test]
fn test_degraded_link_drops_parameters_until_restored() {
    let clock = clock_at(12, 0);
    let controller = MockController::new(&clock);
    let mut gateway = gateway_with(&test_config(), &clock, &controller);
    gateway.tick();
    assert!(gateway.params().is_some());

    controller.set_behaviour(Behaviour::Silent);
    for _ in 0..3 {
        clock.advance(Duration::from_secs(1));
        let report = gateway.tick();
        assert!(report.poll_error.is_some());
    }
    assert!(gateway.link_health().degraded);
    assert!(gateway.params().is_none());
    assert!(gateway.handle().snapshot().link.degraded);

    controller.set_behaviour(Behaviour::Normal);
    clock.advance(Duration::from_secs(1));
    gateway.tick();
    assert!(!gateway.link_health().degraded);
    assert!(gateway.params().is_some());
    let events: Vec<&str> = gateway.events().recent().collect();
    assert!(events.iter().any(|e| e.ends_with("serial link degraded")));
    assert!(events.iter().any(|e| e.ends_with("serial link restored")));
}

#[test]
fn test_watchdog_requests_serial_restart() {
    let clock = clock_at(12, 0);
    let controller = MockController::new(&clock);
    controller.set_behaviour(Behaviour::Silent);
    let mut gateway = gateway_with(&test_config(), &clock, &controller);

    let mut restarted_after = None;
    for tick in 0..120 {
        let report = gateway.tick();
        if report.watchdog.restart_serial {
            restarted_after = Some(tick);
            break;
        }
        clock.advance(Duration::from_secs(1));
    }
    let ticks = restarted_after.expect("watchdog never fired");
    assert!(ticks >= 50, "fired after {ticks} ticks");

    let fresh = MockController::new(&clock);
    gateway.replace_serial(fresh.boxed());
    clock.advance(Duration::from_millis(10));
    let report = gateway.tick();
    assert!(report.polled);
    assert!(gateway.params().is_some());

    let snapshot = gateway.handle().snapshot();
    assert_eq!(snapshot.diagnostics.last_reset_reason, ResetReason::Watchdog);
    assert_eq!(snapshot.watchdog.serial_restarts, 1);
    assert!(snapshot.events.iter().any(|e| e.ends_with("serial link degraded")));
}

#[test]
fn test_watchdog_requests_network_restart() {
    let clock = clock_at(12, 0);
    let controller = MockController::new(&clock);
    let transport = RecordingTransport::default();
    let mut gateway = gateway_with(&test_config(), &clock, &controller).with_transport(Box::new(transport.clone()));

    let mut fired = 0;
    for _ in 0..=60 {
        let report = gateway.tick();
        assert!(!report.watchdog.restart_serial);
        if report.watchdog.restart_network {
            fired += 1;
        }
        clock.advance(Duration::from_secs(10));
    }
    assert_eq!(fired, 1);
    assert_eq!(transport.count(), 0);
}

#[test]
fn test_telemetry_published_through_transport() {
    let clock = clock_at(12, 0);
    let controller = MockController::new(&clock);
    let transport = RecordingTransport::online();
    let mut gateway = gateway_with(&test_config(), &clock, &controller).with_transport(Box::new(transport.clone()));

    let report = gateway.tick();
    let publish = report.publish.expect("first tick publishes");
    assert!(publish.sent > 0);
    assert_eq!(transport.payloads(topics::VRMS), vec!["231.5".to_string()]);
    assert_eq!(transport.payloads(topics::STATE), vec!["online".to_string()]);

    clock.advance(Duration::from_secs(1));
    assert!(gateway.tick().publish.is_none());
}

#[test]
fn test_relay_plus_enforces_daily_maximum() {
    let clock = clock_at(21, 0);
    let controller = MockController::new(&clock);
    controller.set_relay_output(true);
    let mut config = test_config();
    config.relay_plus.enabled = true;
    config.relay_plus.min_minutes = 0;
    config.relay_plus.max_minutes = 60;
    config.relay_plus.hour = 21;
    let mut gateway = gateway_with(&config, &clock, &controller);

    for _ in 0..60 {
        gateway.tick();
        assert_eq!(controller.relay_mode(), Some(RoutingMode::Auto));
        clock.advance(Duration::from_secs(60));
    }
    let report = gateway.tick();
    assert_eq!(report.relay_plus, Some(RelayPlusAction::ForceOff));
    assert_eq!(controller.relay_mode(), Some(RoutingMode::Stop));

    // Released at the next reference hour.
    let mut released = false;
    for _ in 0..24 * 60 {
        clock.advance(Duration::from_secs(60));
        if gateway.tick().relay_plus == Some(RelayPlusAction::Release) {
            released = true;
            break;
        }
    }
    assert!(released);
    assert_eq!(controller.relay_mode(), Some(RoutingMode::Auto));
}

#[test]
fn test_remote_relay_mirrors_local_relay() {
    let clock = clock_at(12, 0);
    let controller = MockController::new(&clock);
    let endpoint = ScriptedEndpoint::default();
    let mut gateway = gateway_with(&test_config(), &clock, &controller)
        .with_mirror(Box::new(endpoint.clone()), Duration::from_secs(20));

    gateway.tick();
    controller.set_stat(StatField::RelayMode, f64::from(RoutingMode::Forced.code()));
    clock.advance(Duration::from_secs(10));
    gateway.tick();
    assert_eq!(endpoint.calls(), vec![false]);

    clock.advance(Duration::from_secs(10));
    gateway.tick();
    assert_eq!(endpoint.calls(), vec![false, true]);
    assert_eq!(gateway.mirror_state().and_then(|m| m.last_commanded), Some(true));
}

#[test]
fn test_api_requests_against_running_gateway() {
    let clock = clock_at(12, 0);
    let controller = MockController::new(&clock);
    let mut gateway = gateway_with(&test_config(), &clock, &controller);
    let handle = gateway.handle();
    gateway.tick();

    let stats = api::handle_line(r#"{"cmd":"stats"}"#, &handle);
    assert!(stats.ok);
    assert_eq!(stats.data.as_ref().map(|d| d["V_RMS"].clone()), Some(serde_json::json!(231.5)));

    let queued = api::handle_line(r#"{"cmd":"triac","mode":"stop"}"#, &handle);
    assert!(queued.ok);
    gateway.tick();
    assert_eq!(
        RoutingMode::from_code(controller.stat(StatField::TriacMode)),
        Some(RoutingMode::Stop)
    );

    let csv = api::handle_line(r#"{"cmd":"history","format":"csv"}"#, &handle);
    let text = csv.data.and_then(|d| d.as_str().map(str::to_owned)).unwrap();
    assert!(text.starts_with(pvgate::history::CSV_HEADER));
    assert_eq!(text.lines().count(), 2);

    let bad = api::handle_line("not json", &handle);
    assert!(!bad.ok);
}

#[test]
fn test_relay_plus_restores_operator_mode_after_minimum() {
    let clock = clock_at(21, 0);
    let controller = MockController::new(&clock);
    controller.set_stat(StatField::RelayMode, f64::from(RoutingMode::Stop.code()));
    let mut config = test_config();
    config.relay_plus.enabled = true;
    config.relay_plus.forced = true;
    config.relay_plus.min_minutes = 5;
    config.relay_plus.hour = 21;
    let mut gateway = gateway_with(&config, &clock, &controller);

    assert_eq!(gateway.tick().relay_plus, Some(RelayPlusAction::KeepOn));
    assert_eq!(controller.relay_mode(), Some(RoutingMode::Forced));

    let mut released = false;
    for _ in 0..30 {
        clock.advance(Duration::from_secs(60));
        if gateway.tick().relay_plus == Some(RelayPlusAction::Release) {
            released = true;
            break;
        }
    }
    assert!(released);
    assert_eq!(controller.relay_mode(), Some(RoutingMode::Stop));
}

#[test]
fn test_relay_plus_maximum_survives_manual_force() {
    let clock = clock_at(21, 0);
    let controller = MockController::new(&clock);
    controller.set_relay_output(true);
    let mut config = test_config();
    config.relay_plus.enabled = true;
    config.relay_plus.min_minutes = 0;
    config.relay_plus.max_minutes = 60;
    config.relay_plus.hour = 21;
    let mut gateway = gateway_with(&config, &clock, &controller);
    let handle = gateway.handle();

    for _ in 0..60 {
        gateway.tick();
        clock.advance(Duration::from_secs(60));
    }
    assert_eq!(gateway.tick().relay_plus, Some(RelayPlusAction::ForceOff));
    assert_eq!(controller.relay_mode(), Some(RoutingMode::Stop));

    handle.submit(Intent::SetRelayMode(RoutingMode::Forced)).unwrap();
    clock.advance(Duration::from_secs(60));
    gateway.tick();
    assert_eq!(controller.relay_mode(), Some(RoutingMode::Forced));

    // Next poll sees the relay on and the maximum is enforced again.
    clock.advance(Duration::from_secs(60));
    assert_eq!(gateway.tick().relay_plus, Some(RelayPlusAction::ForceOff));
    assert_eq!(controller.relay_mode(), Some(RoutingMode::Stop));

    // The operator's latest choice comes back with the new cycle.
    let mut released = false;
    for _ in 0..24 * 60 {
        clock.advance(Duration::from_secs(60));
        if gateway.tick().relay_plus == Some(RelayPlusAction::Release) {
            released = true;
            break;
        }
    }
    assert!(released);
    assert_eq!(controller.relay_mode(), Some(RoutingMode::Forced));
}

#[test]
fn test_failed_boost_command_waits_for_poll_cadence() {
    let clock = clock_at(12, 0);
    let controller = MockController::new(&clock);
    let mut gateway = gateway_with(&test_config(), &clock, &controller);
    let handle = gateway.handle();
    gateway.tick();

    controller.set_behaviour(Behaviour::Silent);
    handle.submit(Intent::Boost { on: true }).unwrap();
    gateway.tick();
    assert_eq!(controller.requests_with_tag("BOOST").len(), 1);

    for _ in 0..5 {
        clock.advance(Duration::from_millis(100));
        gateway.tick();
    }
    assert_eq!(controller.requests_with_tag("BOOST").len(), 1);
    assert_eq!(gateway.link_health().consecutive_timeouts, 1);
    assert!(!gateway.link_health().degraded);

    clock.advance(Duration::from_secs(1));
    gateway.tick();
    assert_eq!(controller.requests_with_tag("BOOST").len(), 2);
}
