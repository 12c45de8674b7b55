//! Time-ordered event stream feeding the stepper.

use chrono::{DateTime, FixedOffset};

use crate::util::Cost;

/// What an event does once its start time passes.
#[derive(Debug, Clone)]
pub enum EventKind {
    /// Sets one named fixed load series value on a grid connector.
    FixedLoad {
        name: String,
        gc_id: String,
        value: f64,
    },
    /// Sets one named local generation value (enters as negative load).
    LocalGeneration {
        name: String,
        gc_id: String,
        value: f64,
    },
    /// Grid operator update: any subset of cap, tariff, schedule target,
    /// charging window.
    GridSignal {
        gc_id: String,
        max_power: Option<f64>,
        cost: Option<Cost>,
        target: Option<f64>,
        window: Option<bool>,
    },
    /// Vehicle arrives: attach to a station, apply the driving consumption.
    VehicleArrival {
        vehicle_id: String,
        /// SoC spent on the trip, <= 0.
        soc_delta: f64,
        connected_charging_station: Option<String>,
        estimated_time_of_departure: Option<DateTime<FixedOffset>>,
        desired_soc: Option<f64>,
    },
    /// Vehicle departs: detach, optionally announce the return.
    VehicleDeparture {
        vehicle_id: String,
        estimated_time_of_arrival: Option<DateTime<FixedOffset>>,
    },
    /// Updates a vehicle's individual schedule target (kW).
    VehicleSchedule { vehicle_id: String, schedule: f64 },
}

impl EventKind {
    /// Vehicle the event refers to, if any.
    pub fn vehicle_id(&self) -> Option<&str> {
        match self {
            EventKind::VehicleArrival { vehicle_id, .. }
            | EventKind::VehicleDeparture { vehicle_id, .. }
            | EventKind::VehicleSchedule { vehicle_id, .. } => Some(vehicle_id),
            _ => None,
        }
    }

    /// Grid connector the event refers to, if any.
    pub fn gc_id(&self) -> Option<&str> {
        match self {
            EventKind::FixedLoad { gc_id, .. }
            | EventKind::LocalGeneration { gc_id, .. }
            | EventKind::GridSignal { gc_id, .. } => Some(gc_id),
            _ => None,
        }
    }
}

/// An event with the moment it becomes known and the moment it takes effect.
#[derive(Debug, Clone)]
pub struct Event {
    /// When the event becomes visible to strategies.
    pub signal_time: DateTime<FixedOffset>,
    /// When the effect begins.
    pub start_time: DateTime<FixedOffset>,
    /// Insertion order, ties events with equal times.
    pub seq: usize,
    pub kind: EventKind,
}

/// All scenario events, released to the world by signal time.
///
/// Events stay hidden until their `signal_time` passes; the stepper then
/// moves them into the world's visible future where strategies may inspect
/// them until their `start_time` gates the actual effect.
#[derive(Debug, Clone, Default)]
pub struct EventQueue {
    /// Sorted by `(signal_time, seq)`.
    pending: Vec<Event>,
}

impl EventQueue {
    pub fn new(mut events: Vec<Event>) -> Self {
        for (seq, event) in events.iter_mut().enumerate() {
            event.seq = seq;
        }
        events.sort_by(|a, b| a.signal_time.cmp(&b.signal_time).then(a.seq.cmp(&b.seq)));
        Self { pending: events }
    }

    /// Removes and returns every event signaled at or before `time`.
    pub fn release_until(&mut self, time: DateTime<FixedOffset>) -> Vec<Event> {
        let split = self.pending.partition_point(|e| e.signal_time <= time);
        self.pending.drain(..split).collect()
    }

    /// Events not yet signaled.
    pub fn pending(&self) -> &[Event] {
        &self.pending
    }

    /// Applies `adjust` to every pending event's signal time. Strategies with
    /// contractual foresight (market prices, vehicle rotations) widen their
    /// horizon this way before the run starts.
    pub fn adjust_signal_times(
        &mut self,
        mut adjust: impl FnMut(&Event) -> Option<DateTime<FixedOffset>>,
    ) -> usize {
        let mut changed = 0;
        for event in &mut self.pending {
            if let Some(new_time) = adjust(event) {
                if new_time != event.signal_time {
                    event.signal_time = new_time;
                    changed += 1;
                }
            }
        }
        self.pending
            .sort_by(|a, b| a.signal_time.cmp(&b.signal_time).then(a.seq.cmp(&b.seq)));
        changed
    }
}

/// Sorts visible events into application order: by start time, stable by
/// insertion, with the arrival of a vehicle moved before a departure of the
/// same vehicle at the same start time.
pub fn sort_for_application(events: &mut Vec<Event>) {
    events.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.seq.cmp(&b.seq)));

    let mut i = 0;
    while i < events.len() {
        let mut j = i + 1;
        while j < events.len() && events[j].start_time == events[i].start_time {
            j += 1;
        }
        // within one start-time run: arrival before departure per vehicle
        let run = &mut events[i..j];
        let mut changed = true;
        while changed {
            changed = false;
            for k in 1..run.len() {
                let swap = match (&run[k - 1].kind, &run[k].kind) {
                    (
                        EventKind::VehicleDeparture { vehicle_id: dep, .. },
                        EventKind::VehicleArrival { vehicle_id: arr, .. },
                    ) => dep == arr,
                    _ => false,
                };
                if swap {
                    run.swap(k - 1, k);
                    changed = true;
                }
            }
        }
        i = j;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    fn fixed_load(signal: &str, start: &str, value: f64) -> Event {
        Event {
            signal_time: dt(signal),
            start_time: dt(start),
            seq: 0,
            kind: EventKind::FixedLoad {
                name: "load".into(),
                gc_id: "GC1".into(),
                value,
            },
        }
    }

    #[test]
    fn releases_by_signal_time() {
        let mut queue = EventQueue::new(vec![
            fixed_load("2020-01-01T02:00:00+01:00", "2020-01-01T02:00:00+01:00", 2.0),
            fixed_load("2020-01-01T00:00:00+01:00", "2020-01-01T01:00:00+01:00", 1.0),
        ]);
        let released = queue.release_until(dt("2020-01-01T00:00:00+01:00"));
        assert_eq!(released.len(), 1);
        assert_eq!(queue.pending().len(), 1);
        let rest = queue.release_until(dt("2020-01-01T12:00:00+01:00"));
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn stable_order_for_equal_start_times() {
        let mut events = vec![
            fixed_load("2020-01-01T00:00:00+01:00", "2020-01-01T01:00:00+01:00", 1.0),
            fixed_load("2020-01-01T00:00:00+01:00", "2020-01-01T01:00:00+01:00", 2.0),
        ];
        events[0].seq = 0;
        events[1].seq = 1;
        sort_for_application(&mut events);
        match (&events[0].kind, &events[1].kind) {
            (EventKind::FixedLoad { value: a, .. }, EventKind::FixedLoad { value: b, .. }) => {
                assert_eq!(*a, 1.0);
                assert_eq!(*b, 2.0);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn arrival_precedes_departure_of_same_vehicle() {
        let t = "2020-01-01T08:00:00+01:00";
        let mut events = vec![
            Event {
                signal_time: dt(t),
                start_time: dt(t),
                seq: 0,
                kind: EventKind::VehicleDeparture {
                    vehicle_id: "v1".into(),
                    estimated_time_of_arrival: None,
                },
            },
            Event {
                signal_time: dt(t),
                start_time: dt(t),
                seq: 1,
                kind: EventKind::VehicleArrival {
                    vehicle_id: "v1".into(),
                    soc_delta: -0.1,
                    connected_charging_station: Some("cs".into()),
                    estimated_time_of_departure: None,
                    desired_soc: None,
                },
            },
        ];
        sort_for_application(&mut events);
        assert!(matches!(events[0].kind, EventKind::VehicleArrival { .. }));
        assert!(matches!(events[1].kind, EventKind::VehicleDeparture { .. }));
    }

    #[test]
    fn different_vehicles_keep_insertion_order() {
        let t = "2020-01-01T08:00:00+01:00";
        let mut events = vec![
            Event {
                signal_time: dt(t),
                start_time: dt(t),
                seq: 0,
                kind: EventKind::VehicleDeparture {
                    vehicle_id: "v1".into(),
                    estimated_time_of_arrival: None,
                },
            },
            Event {
                signal_time: dt(t),
                start_time: dt(t),
                seq: 1,
                kind: EventKind::VehicleArrival {
                    vehicle_id: "v2".into(),
                    soc_delta: -0.1,
                    connected_charging_station: None,
                    estimated_time_of_departure: None,
                    desired_soc: None,
                },
            },
        ];
        sort_for_application(&mut events);
        assert!(matches!(events[0].kind, EventKind::VehicleDeparture { .. }));
    }

    #[test]
    fn signal_time_adjustment_resorts() {
        let mut queue = EventQueue::new(vec![
            fixed_load("2020-01-01T06:00:00+01:00", "2020-01-01T06:00:00+01:00", 1.0),
            fixed_load("2020-01-01T05:00:00+01:00", "2020-01-01T05:00:00+01:00", 2.0),
        ]);
        let start = dt("2020-01-01T00:00:00+01:00");
        let changed = queue.adjust_signal_times(|_| Some(start));
        assert_eq!(changed, 2);
        let released = queue.release_until(start);
        assert_eq!(released.len(), 2);
    }
}
