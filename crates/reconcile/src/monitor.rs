//! Pod health monitor. Pure decisions over the observed master pod; the
//! orchestrator does the fetching and acts on the verdict.

use std::time::Duration;

use butler_core::{ObservedEvent, ObservedPod, PodPhase, RestartReason};
use chrono::{DateTime, Utc};

/// Verdict of the starting-issue detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartCheck {
    Continue,
    /// No provisioning start recorded; bootstrap has to be redone from outside.
    NoProvisionRecord,
    /// Pending past the timeout with corroborating warning events.
    Stuck(Vec<String>),
}

/// Only pods pending past `timeout` consult the events.
pub fn pending_timed_out(provision_start: DateTime<Utc>, pod: &ObservedPod, now: DateTime<Utc>, timeout: Duration) -> bool {
    let Ok(timeout) = chrono::Duration::from_std(timeout) else { return false };
    pod.phase == PodPhase::Pending && provision_start.checked_add_signed(timeout).is_some_and(|deadline| now > deadline)
}

/// A terminating pod is on its way out after a restart; it is never judged.
pub fn detect_starting_issues(
    provision_start: Option<DateTime<Utc>>,
    pod: &ObservedPod,
    events: &[ObservedEvent],
    now: DateTime<Utc>,
    timeout: Duration,
) -> StartCheck {
    if pod.terminating {
        return StartCheck::Continue;
    }
    let Some(start) = provision_start else { return StartCheck::NoProvisionRecord };
    if !pending_timed_out(start, pod, now, timeout) {
        return StartCheck::Continue;
    }
    let matching: Vec<String> = events
        .iter()
        .filter(|e| e.timestamp.is_some_and(|t| t >= start))
        .filter(|e| !e.is_normal())
        .filter(|e| e.concerns(&pod.name))
        .map(|e| format!("Message: {} Subobject: {}", e.message, e.field_path.as_deref().unwrap_or("")))
        .collect();
    if matching.is_empty() {
        StartCheck::Continue
    } else {
        StartCheck::Stuck(matching)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Requeue after the delay; nothing is wrong yet.
    Wait(Duration),
    Restart(RestartReason),
}

pub fn assess_readiness(pod: &ObservedPod, backoff: Duration) -> Readiness {
    if pod.terminating || pod.phase != PodPhase::Running {
        return Readiness::Wait(backoff);
    }
    if let Some(detail) = pod.containers.iter().find_map(|c| c.terminated.clone()) {
        return Readiness::Restart(RestartReason::platform(detail));
    }
    if pod.containers.iter().all(|c| c.ready) {
        Readiness::Ready
    } else {
        Readiness::Wait(backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use butler_core::state::ContainerObservation;

    const TIMEOUT: Duration = Duration::from_secs(120);
    const BACKOFF: Duration = Duration::from_secs(5);

    fn pod(phase: PodPhase, containers: Vec<ContainerObservation>) -> ObservedPod {
        ObservedPod { name: "jenkins-ci".into(), phase, terminating: false, containers }
    }

    fn container(ready: bool, terminated: Option<&str>) -> ContainerObservation {
        ContainerObservation { name: "jenkins-master".into(), ready, terminated: terminated.map(str::to_string) }
    }

    fn warning(name: &str, at: DateTime<Utc>) -> ObservedEvent {
        ObservedEvent {
            name: name.into(),
            involved_name: String::new(),
            type_: "Warning".into(),
            timestamp: Some(at),
            message: "0/3 nodes are available".into(),
            field_path: None,
        }
    }

    #[test]
    fn missing_provision_record_stops() {
        let now = Utc::now();
        assert_eq!(detect_starting_issues(None, &pod(PodPhase::Running, vec![]), &[], now, TIMEOUT), StartCheck::NoProvisionRecord);
    }

    #[test]
    fn pending_past_timeout_needs_matching_warning() {
        let now = Utc::now();
        let start = now - chrono::Duration::minutes(3);
        let p = pod(PodPhase::Pending, vec![]);
        assert_eq!(detect_starting_issues(Some(start), &p, &[], now, TIMEOUT), StartCheck::Continue);

        let unrelated = [
            warning("jenkins-other.1", now),
            ObservedEvent { type_: "Normal".into(), ..warning("jenkins-ci.2", now) },
            warning("jenkins-ci.3", start - chrono::Duration::seconds(1)),
        ];
        assert_eq!(detect_starting_issues(Some(start), &p, &unrelated, now, TIMEOUT), StartCheck::Continue);

        let verdict = detect_starting_issues(Some(start), &p, &[warning("jenkins-ci.17a", now)], now, TIMEOUT);
        assert!(matches!(verdict, StartCheck::Stuck(ref m) if m[0].contains("0/3 nodes")));
    }

    #[test]
    fn terminating_pod_is_not_judged() {
        let now = Utc::now();
        let mut p = pod(PodPhase::Pending, vec![]);
        p.terminating = true;
        assert_eq!(detect_starting_issues(None, &p, &[], now, TIMEOUT), StartCheck::Continue);
        let start = now - chrono::Duration::minutes(3);
        assert_eq!(detect_starting_issues(Some(start), &p, &[warning("jenkins-ci.1", now)], now, TIMEOUT), StartCheck::Continue);
    }

    #[test]
    fn pending_within_timeout_ignores_events() {
        let now = Utc::now();
        let start = now - chrono::Duration::seconds(30);
        let verdict = detect_starting_issues(Some(start), &pod(PodPhase::Pending, vec![]), &[warning("jenkins-ci.1", now)], now, TIMEOUT);
        assert_eq!(verdict, StartCheck::Continue);
    }

    #[test]
    fn readiness_states() {
        assert_eq!(assess_readiness(&pod(PodPhase::Pending, vec![]), BACKOFF), Readiness::Wait(BACKOFF));
        let mut terminating = pod(PodPhase::Running, vec![container(true, None)]);
        terminating.terminating = true;
        assert_eq!(assess_readiness(&terminating, BACKOFF), Readiness::Wait(BACKOFF));
        assert_eq!(assess_readiness(&pod(PodPhase::Running, vec![container(false, None)]), BACKOFF), Readiness::Wait(BACKOFF));
        assert_eq!(assess_readiness(&pod(PodPhase::Running, vec![container(true, None)]), BACKOFF), Readiness::Ready);
        match assess_readiness(&pod(PodPhase::Running, vec![container(true, None), container(false, Some("OOMKilled"))]), BACKOFF) {
            Readiness::Restart(r) => assert_eq!(r.messages, vec!["OOMKilled".to_string()]),
            other => panic!("expected restart, got {other:?}"),
        }
    }
}
