use dispatch_core::events::{topics, EventBus, EventPayload};
use dispatch_core::metrics::{
    names, AlertKind, AlertSeverity, BottleneckSeverity, ExecutionUsage, HealthSnapshot,
    MetricUnit, MetricsConfig, ResourceKind, ResourceMetricsCollector,
};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration};

fn collector(capacity: usize) -> ResourceMetricsCollector {
    ResourceMetricsCollector::new(
        MetricsConfig {
            history_capacity: capacity,
            ..MetricsConfig::default()
        },
        None,
    )
}

#[test]
fn test_history_evicts_oldest_sample() {
    let collector = collector(3);
    for value in [1.0, 2.0, 3.0, 4.0] {
        collector.record_metric("latency", value, MetricUnit::Milliseconds, None);
    }

    let values: Vec<f64> = collector
        .get_metrics("latency")
        .iter()
        .map(|m| m.value)
        .collect();
    assert_eq!(values, vec![2.0, 3.0, 4.0]);
}

#[test]
fn test_histories_are_independent_per_name() {
    let collector = collector(2);
    collector.record_metric("a", 1.0, MetricUnit::Count, None);
    collector.record_metric("a", 2.0, MetricUnit::Count, None);
    collector.record_metric("a", 3.0, MetricUnit::Count, None);
    collector.record_metric("b", 9.0, MetricUnit::Count, None);

    assert_eq!(collector.get_metrics("a").len(), 2);
    assert_eq!(collector.get_metrics("b").len(), 1);
    assert!(collector.get_metrics("missing").is_empty());
}

#[test]
fn test_bottleneck_boundaries() {
    let cases = [
        (0.49, BottleneckSeverity::Low),
        (0.5, BottleneckSeverity::Medium),
        (0.69, BottleneckSeverity::Medium),
        (0.7, BottleneckSeverity::High),
        (0.89, BottleneckSeverity::High),
        (0.9, BottleneckSeverity::Critical),
        (1.0, BottleneckSeverity::Critical),
    ];
    for (utilization, expected) in cases {
        assert_eq!(
            BottleneckSeverity::classify(utilization),
            expected,
            "utilization {}",
            utilization
        );
    }
}

#[test]
fn test_detect_bottlenecks_most_severe_first() {
    let collector = collector(10);
    collector.record_utilization(ResourceKind::Cpu, 0.6);
    collector.record_utilization(ResourceKind::Memory, 0.95);
    collector.record_utilization(ResourceKind::Network, 0.2);
    collector.record_utilization(ResourceKind::Storage, 0.75);

    let bottlenecks = collector.detect_bottlenecks();
    let order: Vec<(ResourceKind, BottleneckSeverity)> = bottlenecks
        .iter()
        .map(|b| (b.resource, b.severity))
        .collect();
    assert_eq!(
        order,
        vec![
            (ResourceKind::Memory, BottleneckSeverity::Critical),
            (ResourceKind::Storage, BottleneckSeverity::High),
            (ResourceKind::Cpu, BottleneckSeverity::Medium),
        ]
    );
}

#[test]
fn test_record_execution_bundle() {
    let collector = collector(100);
    let usage = ExecutionUsage {
        cost: Some(0.02),
        memory_mb: Some(256.0),
        memory_limit_mb: Some(512.0),
        tokens: 2000,
        api_calls: 3,
        ..ExecutionUsage::default()
    };

    let snapshot = collector.record_execution(&usage, 2000, true);
    assert!((snapshot.resource_utilization - 0.5).abs() < 1e-9);
    assert!((snapshot.waste - 0.5).abs() < 1e-9);

    assert_eq!(collector.get_metrics(names::EXECUTION_DURATION)[0].value, 2000.0);
    assert_eq!(collector.get_metrics(names::EXECUTION_COST)[0].value, 0.02);
    assert_eq!(collector.get_metrics(names::MEMORY_USAGE)[0].value, 256.0);
    assert_eq!(collector.get_metrics(names::TOKENS_USED)[0].value, 2000.0);
    assert_eq!(collector.get_metrics(names::API_CALLS)[0].value, 3.0);
    assert_eq!(collector.get_metrics(names::THROUGHPUT)[0].value, 1000.0);
    assert_eq!(collector.utilization(ResourceKind::Memory), Some(0.5));
    assert!(collector.latest_efficiency().is_some());
}

#[test]
fn test_cost_analysis_suggests_savings_for_failures() {
    let collector = collector(100);
    let usage = ExecutionUsage {
        cost: Some(0.01),
        ..ExecutionUsage::default()
    };
    for _ in 0..5 {
        collector.record_execution(&usage, 100, false);
    }

    let analysis = collector.get_cost_analysis();
    assert!((analysis.total_cost - 0.05).abs() < 1e-9);
    assert_eq!(analysis.trend.len(), 5);
    assert!((analysis.average_cost - 0.01).abs() < 1e-9);
    assert!(analysis.projected_monthly_cost > 0.0);

    let actions: Vec<&str> = analysis
        .opportunities
        .iter()
        .map(|o| o.action.as_str())
        .collect();
    assert_eq!(actions, vec!["improve utilization", "reduce waste"]);
}

#[test]
fn test_cost_analysis_without_data() {
    let analysis = collector(10).get_cost_analysis();
    assert_eq!(analysis.total_cost, 0.0);
    assert!(analysis.trend.is_empty());
    assert_eq!(analysis.projected_monthly_cost, 0.0);
    assert!(analysis.opportunities.is_empty());
}

#[tokio::test]
async fn test_health_breach_publishes_alert() {
    let bus = Arc::new(EventBus::new());
    bus.start();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    bus.subscribe_fn("alerts", topics::PATTERN_RESOURCE_ALERT, move |event| {
        let sink = Arc::clone(&sink);
        async move {
            if let EventPayload::ResourceAlert(alert) = &event.payload {
                sink.lock().unwrap().push((event.topic.clone(), alert.kind, alert.severity));
            }
            Ok(())
        }
    })
    .await
    .unwrap();

    let collector = ResourceMetricsCollector::new(MetricsConfig::default(), Some(bus.clone()));
    let alerts = collector
        .record_health(HealthSnapshot::new(0.5, 0.01, 0.85))
        .await;
    assert_eq!(alerts.len(), 2);

    // healthy snapshot raises nothing
    assert!(collector
        .record_health(HealthSnapshot::new(1.0, 0.0, 0.1))
        .await
        .is_empty());
    assert_eq!(collector.health_history().len(), 2);

    sleep(Duration::from_millis(50)).await;
    let received = received.lock().unwrap().clone();
    assert_eq!(
        received,
        vec![
            (
                "resource/alert/availability".to_string(),
                AlertKind::Availability,
                AlertSeverity::Warning
            ),
            (
                "resource/alert/saturation".to_string(),
                AlertKind::Saturation,
                AlertSeverity::Warning
            ),
        ]
    );
}

#[tokio::test]
async fn test_alert_without_bus_is_still_returned() {
    let collector = collector(10);
    let alerts = collector
        .record_health(HealthSnapshot::new(1.0, 0.5, 0.0))
        .await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::ErrorRate);
    assert_eq!(alerts[0].severity, AlertSeverity::Critical);
}
