//! Partition assignment strategies.
//!
//! The rdkafka backend hands the strategy name to librdkafka; the in-memory
//! backend runs [`Assignor::assign`] itself.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Member id to the `(topic, partition)` pairs it owns.
pub type Assignment = BTreeMap<String, Vec<(String, i32)>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Assignor {
    Sticky,
    RoundRobin,
    #[default]
    Range,
}

impl Assignor {
    pub fn name(&self) -> &'static str {
        match self {
            Assignor::Sticky => "sticky",
            Assignor::RoundRobin => "roundrobin",
            Assignor::Range => "range",
        }
    }

    /// Value for librdkafka's `partition.assignment.strategy`.
    pub fn rdkafka_strategy(&self) -> &'static str {
        match self {
            Assignor::Sticky => "cooperative-sticky",
            Assignor::RoundRobin => "roundrobin",
            Assignor::Range => "range",
        }
    }

    /// Distribute the partitions of every topic among the members subscribed
    /// to it.
    ///
    /// `members` maps member id to its subscribed topics, `partitions` maps
    /// topic to partition count. `previous` is only consulted by the sticky
    /// strategy. Every member appears in the result, possibly with nothing.
    pub fn assign(
        &self,
        members: &BTreeMap<String, BTreeSet<String>>,
        partitions: &BTreeMap<String, i32>,
        previous: &Assignment,
    ) -> Assignment {
        let mut assignment: Assignment = members
            .keys()
            .map(|member| (member.clone(), Vec::new()))
            .collect();
        if members.is_empty() {
            return assignment;
        }

        match self {
            Assignor::Range => assign_range(members, partitions, &mut assignment),
            Assignor::RoundRobin => assign_round_robin(members, partitions, &mut assignment),
            Assignor::Sticky => assign_sticky(members, partitions, previous, &mut assignment),
        }

        for owned in assignment.values_mut() {
            owned.sort();
        }
        assignment
    }
}

impl fmt::Display for Assignor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Assignor {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sticky" => Ok(Assignor::Sticky),
            "round-robin" | "roundrobin" => Ok(Assignor::RoundRobin),
            "range" => Ok(Assignor::Range),
            other => Err(ConfigError::UnknownAssignor(other.to_string())),
        }
    }
}

fn subscribers<'a>(
    members: &'a BTreeMap<String, BTreeSet<String>>,
    topic: &str,
) -> Vec<&'a String> {
    members
        .iter()
        .filter(|(_, topics)| topics.contains(topic))
        .map(|(member, _)| member)
        .collect()
}

fn push(assignment: &mut Assignment, member: &str, topic: &str, partition: i32) {
    if let Some(owned) = assignment.get_mut(member) {
        owned.push((topic.to_string(), partition));
    }
}

fn assign_range(
    members: &BTreeMap<String, BTreeSet<String>>,
    partitions: &BTreeMap<String, i32>,
    assignment: &mut Assignment,
) {
    for (topic, &count) in partitions {
        let subs = subscribers(members, topic);
        if subs.is_empty() || count <= 0 {
            continue;
        }
        let m = subs.len() as i32;
        let per_member = count / m;
        let extra = count % m;
        for (i, member) in subs.into_iter().enumerate() {
            let i = i as i32;
            let start = i * per_member + i.min(extra);
            let len = per_member + i32::from(i < extra);
            for partition in start..start + len {
                push(assignment, member, topic, partition);
            }
        }
    }
}

fn assign_round_robin(
    members: &BTreeMap<String, BTreeSet<String>>,
    partitions: &BTreeMap<String, i32>,
    assignment: &mut Assignment,
) {
    let ids: Vec<&String> = members.keys().collect();
    let mut cursor = 0;
    for (topic, &count) in partitions {
        for partition in 0..count.max(0) {
            // Skip members not subscribed to this topic.
            for _ in 0..ids.len() {
                let member = ids[cursor % ids.len()];
                cursor += 1;
                if members[member].contains(topic) {
                    push(assignment, member, topic, partition);
                    break;
                }
            }
        }
    }
}

fn assign_sticky(
    members: &BTreeMap<String, BTreeSet<String>>,
    partitions: &BTreeMap<String, i32>,
    previous: &Assignment,
    assignment: &mut Assignment,
) {
    let mut unassigned: BTreeSet<(String, i32)> = partitions
        .iter()
        .filter(|(topic, _)| !subscribers(members, topic).is_empty())
        .flat_map(|(topic, &count)| (0..count.max(0)).map(move |p| (topic.clone(), p)))
        .collect();

    let total = unassigned.len();
    let floor = total / members.len();
    let mut extra = total % members.len();

    // Members that owned the most keep the larger quotas.
    let mut survivors: Vec<(&String, &Vec<(String, i32)>)> = previous
        .iter()
        .filter(|(member, _)| members.contains_key(*member))
        .collect();
    survivors.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(b.0)));

    for (member, owned) in survivors {
        let quota = if extra > 0 {
            extra -= 1;
            floor + 1
        } else {
            floor
        };
        let mut kept = 0;
        for tp in owned {
            if kept == quota {
                break;
            }
            if members[member].contains(&tp.0) && unassigned.remove(tp) {
                push(assignment, member, &tp.0, tp.1);
                kept += 1;
            }
        }
    }

    for (topic, partition) in unassigned {
        let target = members
            .iter()
            .filter(|(_, topics)| topics.contains(&topic))
            .map(|(member, _)| member)
            .min_by_key(|member| (assignment[*member].len(), (*member).clone()));
        if let Some(member) = target {
            push(assignment, member, &topic, partition);
        }
    }
}
