use forgebus::compliance::{
    warmup_ticks, AbortAxis, ComplianceConfig, ComplianceMonitor, ComplianceOutcome, CompliancePhase, MAX_WARMUP_TICKS,
};
use forgebus::subsystems::ThermalConstants;

const AMBIENT_K: f64 = 300.0;

/// Starts a job whose target sits at ambient, so it arms immediately.
fn armed_monitor(config: ComplianceConfig) -> ComplianceMonitor {
    let mut monitor = ComplianceMonitor::new(config);
    monitor.begin_job(0, 100.0, AMBIENT_K, &ThermalConstants::default(), 60.0);
    assert_eq!(monitor.phase(), CompliancePhase::Armed);
    monitor
}

#[cfg(test)]
mod warmup_tests {
    use super::*;

    #[test]
    fn test_warmup_matches_closed_form() {
        let constants = ThermalConstants::default();
        let tau = 1000.0 / 1.5;
        let expected = (-tau * (1.0_f64 - 0.9).ln() / 0.1).ceil() as u64;

        // Target at the steady state 300 + 150 / 1.5 = 400 K
        let ticks = warmup_ticks(150.0, 400.0, &constants, 0.9, 0.1, MAX_WARMUP_TICKS);
        assert_eq!(ticks, expected);
        assert_eq!(ticks, 15351);
    }

    #[test]
    fn test_warmup_zero_without_power_or_rise() {
        let constants = ThermalConstants::default();
        assert_eq!(warmup_ticks(0.0, 400.0, &constants, 0.9, 60.0, MAX_WARMUP_TICKS), 0);
        assert_eq!(warmup_ticks(f64::NAN, 400.0, &constants, 0.9, 60.0, MAX_WARMUP_TICKS), 0);
        assert_eq!(warmup_ticks(150.0, AMBIENT_K, &constants, 0.9, 60.0, MAX_WARMUP_TICKS), 0);
        assert_eq!(warmup_ticks(150.0, 250.0, &constants, 0.9, 60.0, MAX_WARMUP_TICKS), 0);
    }

    #[test]
    fn test_unreachable_target_is_capped() {
        let constants = ThermalConstants::default();
        // 150 W only ever reaches 400 K
        assert_eq!(warmup_ticks(150.0, 900.0, &constants, 0.9, 60.0, 500), 500);
        assert_eq!(warmup_ticks(150.0, 900.0, &constants, 0.9, 60.0, MAX_WARMUP_TICKS), MAX_WARMUP_TICKS);
    }

    #[test]
    fn test_bad_ticks_during_warmup_never_abort() {
        let mut monitor = ComplianceMonitor::default();
        // 1535 s at dt = 60 s
        monitor.begin_job(3, 150.0, 400.0, &ThermalConstants::default(), 60.0);
        assert_eq!(monitor.phase(), CompliancePhase::Warmup);
        assert_eq!(monitor.state().warmup_ticks_required, 26);

        for tick in 1..=26 {
            let outcome = monitor.evaluate(tick, 0.0, AMBIENT_K);
            assert!(matches!(outcome, ComplianceOutcome::WarmingUp { .. }), "tick {}: {:?}", tick, outcome);
            assert_eq!(monitor.state().underflux_streak, 0);
            assert_eq!(monitor.state().temp_miss_streak, 0);
        }
        assert_eq!(monitor.evaluate(27, 150.0, 400.0), ComplianceOutcome::Nominal);
        assert_eq!(monitor.phase(), CompliancePhase::Armed);
    }

    #[test]
    fn test_warmup_counts_down() {
        let mut monitor = ComplianceMonitor::default();
        monitor.begin_job(0, 150.0, 400.0, &ThermalConstants::default(), 60.0);
        assert_eq!(monitor.evaluate(1, 150.0, 300.0), ComplianceOutcome::WarmingUp { remaining: 25 });
        assert_eq!(monitor.evaluate(2, 150.0, 301.0), ComplianceOutcome::WarmingUp { remaining: 24 });
    }
}

#[cfg(test)]
mod abort_tests {
    use super::*;

    #[test]
    fn test_underflux_streak_aborts_on_limit() {
        let mut monitor = armed_monitor(ComplianceConfig::default());

        for tick in 1..5 {
            assert_eq!(monitor.evaluate(tick, 10.0, AMBIENT_K), ComplianceOutcome::Nominal);
            assert_eq!(monitor.state().underflux_streak, tick as u32);
        }
        match monitor.evaluate(5, 10.0, AMBIENT_K) {
            ComplianceOutcome::Abort(record) => {
                assert_eq!(record.job_index, 0);
                assert_eq!(record.tick, 5);
                assert_eq!(record.axis, AbortAxis::Flux);
                assert!((record.flux_ratio - 0.1).abs() < 1e-12);
                assert_eq!(record.ticks_in_job, 5);
            }
            other => panic!("expected abort, got {:?}", other),
        }

        assert_eq!(monitor.phase(), CompliancePhase::Aborted);
        assert_eq!(monitor.job(), None);
        assert_eq!(monitor.state().ticks_in_job, 0);
        assert_eq!(monitor.total_aborts(), 1);
        assert_eq!(monitor.evaluate(6, 10.0, AMBIENT_K), ComplianceOutcome::Idle);
    }

    #[test]
    fn test_good_tick_resets_streak() {
        let mut monitor = armed_monitor(ComplianceConfig::default());
        for tick in 1..=4 {
            monitor.evaluate(tick, 10.0, AMBIENT_K);
        }
        assert_eq!(monitor.evaluate(5, 100.0, AMBIENT_K), ComplianceOutcome::Nominal);
        assert_eq!(monitor.state().underflux_streak, 0);

        for tick in 6..=9 {
            assert_eq!(monitor.evaluate(tick, 10.0, AMBIENT_K), ComplianceOutcome::Nominal);
        }
        assert!(matches!(monitor.evaluate(10, 10.0, AMBIENT_K), ComplianceOutcome::Abort(_)));
    }

    #[test]
    fn test_exactly_half_power_is_not_underflux() {
        let mut monitor = armed_monitor(ComplianceConfig::default());
        for tick in 1..=20 {
            assert_eq!(monitor.evaluate(tick, 50.0, AMBIENT_K), ComplianceOutcome::Nominal);
        }
    }

    #[test]
    fn test_temperature_axis_has_its_own_limit() {
        let config = ComplianceConfig {
            temp_miss_limit: 2,
            ..ComplianceConfig::default()
        };
        let mut monitor = armed_monitor(config);

        // Full power, but the cell reads 90 % of the 300 K target
        assert_eq!(monitor.evaluate(1, 100.0, 270.0), ComplianceOutcome::Nominal);
        match monitor.evaluate(2, 100.0, 270.0) {
            ComplianceOutcome::Abort(record) => assert_eq!(record.axis, AbortAxis::Temperature),
            other => panic!("expected abort, got {:?}", other),
        }
        assert_eq!(monitor.abort_history().len(), 1);
    }

    #[test]
    fn test_clear_stops_watching() {
        let mut monitor = armed_monitor(ComplianceConfig::default());
        monitor.evaluate(1, 0.0, AMBIENT_K);
        monitor.clear();
        assert_eq!(monitor.phase(), CompliancePhase::Idle);
        assert_eq!(monitor.evaluate(2, 0.0, AMBIENT_K), ComplianceOutcome::Idle);
    }

    #[test]
    fn test_zero_limits_fall_back_to_default() {
        let monitor = ComplianceMonitor::new(ComplianceConfig {
            underflux_limit: 0,
            temp_miss_limit: 0,
            min_flux_fraction: 3.0,
            ..ComplianceConfig::default()
        });
        assert_eq!(monitor.config().underflux_limit, 5);
        assert_eq!(monitor.config().temp_miss_limit, 5);
        assert!((monitor.config().min_flux_fraction - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_history_keeps_most_recent_aborts() {
        let config = ComplianceConfig {
            underflux_limit: 1,
            ..ComplianceConfig::default()
        };
        let mut monitor = ComplianceMonitor::new(config);
        for job in 0..20 {
            monitor.begin_job(job, 100.0, AMBIENT_K, &ThermalConstants::default(), 60.0);
            assert!(matches!(monitor.evaluate(job as u64, 0.0, AMBIENT_K), ComplianceOutcome::Abort(_)));
        }
        assert_eq!(monitor.total_aborts(), 20);
        assert_eq!(monitor.abort_history().len(), 16);
        assert_eq!(monitor.abort_history()[0].job_index, 4);
        assert_eq!(monitor.abort_history()[15].job_index, 19);
    }
}
