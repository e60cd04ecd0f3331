//! Oracle functions for scenario verification.
//!
//! Oracles run once a scenario has settled and check invariants that span
//! every member of the [`World`]. Each returns `Err` with a description of
//! the first violation.

use std::collections::{BTreeMap, BTreeSet};

use tessera_proto::{MemberId, MessageId, SubSessionId};

use crate::World;

/// Oracle function type.
pub type OracleFn = Box<dyn FnOnce(&World) -> Result<(), String>>;

/// Every member's session is consistent: no sub-session, current, previous
/// or dropped, ended with unacknowledged payloads.
pub fn all_consistent() -> OracleFn {
    Box::new(|world| {
        for (id, member) in world.members() {
            if !member.session().is_consistent() {
                return Err(format!("{id} is not consistent"));
            }
        }
        Ok(())
    })
}

/// Members sharing a current sub-session agree on who is in it, and that is
/// exactly the set of members that have it as their current sub-session.
pub fn sub_sessions_agree() -> OracleFn {
    Box::new(|world| {
        let mut holders: BTreeMap<SubSessionId, BTreeSet<MemberId>> = BTreeMap::new();
        for (id, member) in world.members() {
            if let Some(cur) = member.session().cur_session() {
                holders.entry(cur.sub_session_id()).or_default().insert(id.clone());
            }
        }

        for (sub_session, holding) in &holders {
            for id in holding {
                let Some(cur) = world.session(id.as_str()).cur_session() else { continue };
                let members: BTreeSet<MemberId> = cur.members().iter().cloned().collect();
                if &members != holding {
                    return Err(format!(
                        "{id} thinks {sub_session} has {} but it is held by {holding:?}",
                        cur.members()
                    ));
                }
            }
        }
        Ok(())
    })
}

/// Members sharing a current sub-session have identical transcripts.
pub fn transcripts_converged() -> OracleFn {
    Box::new(|world| {
        let mut seen: BTreeMap<SubSessionId, (MemberId, BTreeSet<MessageId>)> = BTreeMap::new();
        for (id, member) in world.members() {
            let Some(cur) = member.session().cur_session() else { continue };
            let ids: BTreeSet<MessageId> = cur.transcript().ids().copied().collect();
            match seen.get(&cur.sub_session_id()) {
                Some((other, expected)) if expected != &ids => {
                    return Err(format!(
                        "{id} and {other} diverged in {}: {} vs {} messages",
                        cur.sub_session_id(),
                        ids.len(),
                        expected.len()
                    ));
                },
                Some(_) => {},
                None => {
                    seen.insert(cur.sub_session_id(), (id.clone(), ids));
                },
            }
        }
        Ok(())
    })
}

/// Every payload accepted by anyone in a sub-session was accepted by every
/// member that currently holds that sub-session.
pub fn payloads_delivered() -> OracleFn {
    Box::new(|world| {
        for (id, member) in world.members() {
            let Some(cur) = member.session().cur_session() else { continue };
            for entry in member.session().messages().iter() {
                if entry.sub_session != cur.sub_session_id() {
                    continue;
                }
                for peer in cur.members().iter() {
                    if !world.session(peer.as_str()).messages().contains(&entry.id) {
                        return Err(format!("{peer} never accepted {} seen by {id}", entry.id));
                    }
                }
            }
        }
        Ok(())
    })
}

/// Combine multiple oracles into one.
pub fn all_of(oracles: Vec<OracleFn>) -> OracleFn {
    Box::new(move |world| {
        for oracle in oracles {
            oracle(world)?;
        }
        Ok(())
    })
}
