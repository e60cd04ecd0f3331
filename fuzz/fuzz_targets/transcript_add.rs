//! Fuzz-built message graphs fed into a transcript.
//!
//! Each 4-byte chunk of input describes one message: its author, a bitmask
//! of parents among the ids generated so far (some of which the transcript
//! may have rejected), and its recipients. The transcript must reject
//! invalid messages without changing and keep its bookkeeping coherent for
//! the accepted ones.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tessera_core::{
    MemberSet,
    message::{Message, MessageSet},
    transcript::Transcript,
};
use tessera_proto::{MemberId, MessageBody, MessageId};

const MEMBERS: [&str; 4] = ["alice", "bob", "carol", "dave"];

fuzz_target!(|data: &[u8]| {
    let mut transcript = Transcript::new();
    let mut generated: Vec<MessageId> = Vec::new();

    for (index, chunk) in data.chunks_exact(4).take(64).enumerate() {
        let author = MemberId::from(MEMBERS[chunk[0] as usize % MEMBERS.len()]);
        let parents: MessageSet = generated
            .iter()
            .rev()
            .take(16)
            .enumerate()
            .filter(|(bit, _)| u16::from_le_bytes([chunk[1], chunk[2]]) & (1 << bit) != 0)
            .map(|(_, id)| *id)
            .collect();
        let recipients: MemberSet = MEMBERS
            .iter()
            .enumerate()
            .filter(|(bit, _)| chunk[3] & (1 << bit) != 0)
            .map(|(_, name)| MemberId::from(*name))
            .filter(|member| member != &author)
            .collect();

        let id = MessageId::digest(&[&index.to_le_bytes()[..], chunk].concat());
        generated.push(id);

        let before = transcript.len();
        let message = Message {
            id,
            author,
            parents: parents.clone(),
            recipients,
            body: MessageBody::ExplicitAck { manual: false },
        };
        match transcript.add(message) {
            Ok(acked) => {
                assert_eq!(transcript.len(), before + 1);
                assert!(transcript.contains(&id));
                for acked in acked {
                    assert!(transcript.is_fully_acked(&acked));
                }
                for parent in &parents {
                    assert!(transcript.is_ancestor(parent, &id));
                }
            },
            Err(_) => {
                assert_eq!(transcript.len(), before);
                assert!(!transcript.contains(&id));
            },
        }
    }
});
