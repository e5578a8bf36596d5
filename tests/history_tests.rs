use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use pvgate::history::*;
use pvgate::stats::EnergyIndices;

fn start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 10)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap()
}

fn indices(n: u32) -> EnergyIndices {
    EnergyIndices {
        routed: f64::from(n) * 10.0,
        import: f64::from(n) * 2.0,
        export: f64::from(n),
        impulsion: 0.0,
        relay: f64::from(n) * 0.5,
    }
}

fn filled(samples: u32, interval_min: u16) -> HistoryRingBuffer {
    let interval = HistoryInterval::from_minutes(interval_min).unwrap();
    let mut history = HistoryRingBuffer::new(interval);
    for n in 0..samples {
        assert!(history.sample(start() + interval.as_delta() * n as i32, indices(n)));
    }
    history
}

#[test]
fn test_capacity_is_bounded() {
    let history = filled(HISTORY_CAPACITY as u32 + 1, 30);
    assert_eq!(history.len(), HISTORY_CAPACITY);
    assert_eq!(history.capacity(), 193);
}

#[test]
fn test_oldest_point_dropped_first() {
    let history = filled(HISTORY_CAPACITY as u32 + 1, 30);
    let points: Vec<HistoryPoint> = history.export().into_iter().collect();
    assert_eq!(points.first().map(|p| p.indices), Some(indices(1)));
    assert_eq!(
        points.last().map(|p| p.indices),
        Some(indices(HISTORY_CAPACITY as u32))
    );
}

#[test]
fn test_export_is_chronological() {
    let history = filled(250, 5);
    let export = history.export();
    assert_eq!(export.len(), HISTORY_CAPACITY);
    let times: Vec<NaiveDateTime> = export.iter().map(|p| p.time).collect();
    assert!(times.windows(2).all(|w| w[0] + TimeDelta::minutes(5) == w[1]));
}

#[test]
fn test_export_is_repeatable() {
    let history = filled(10, 60);
    let export = history.export();
    let first: Vec<HistoryPoint> = export.iter().collect();
    let second: Vec<HistoryPoint> = export.iter().collect();
    assert_eq!(first, second);
    assert_eq!(history.len(), 10);
}

#[test]
fn test_interval_change_applies_to_next_sample() {
    let mut history = filled(3, 30);
    let last = history.latest().map(|p| p.time).unwrap();
    history.set_interval(HistoryInterval::from_minutes(60).unwrap());
    assert!(!history.sample(last + TimeDelta::minutes(30), indices(9)));
    assert!(history.sample(last + TimeDelta::minutes(60), indices(9)));
    assert_eq!(history.len(), 4);
}

#[test]
fn test_clear_then_resample() {
    let mut history = filled(20, 10);
    history.clear();
    assert!(history.is_empty());
    assert!(history.export().is_empty());
    assert!(history.sample(start(), indices(0)));
    assert_eq!(history.len(), 1);
}

#[test]
fn test_csv_export_matches_points() {
    let history = filled(3, 120);
    let csv = history.to_csv();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], CSV_HEADER);
    assert_eq!(lines[1], "2024-03-10 00:00:00,0,0,0,0,0");
    assert_eq!(lines[3], "2024-03-10 04:00:00,20,4,2,0,1");
}

#[test]
fn test_interval_rejected_by_deserializer() {
    assert!(serde_json::from_str::<HistoryInterval>("45").is_err());
    assert_eq!(
        serde_json::from_str::<HistoryInterval>("240").unwrap().minutes(),
        240
    );
}
