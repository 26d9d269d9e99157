//! Property tests for batch packing.
//!
//! Run with: `cargo test --test proptest_pack`

use proptest::prelude::*;
use serde_json::json;

use docx_remote_control::{pack, Operation};

fn operation_strategy() -> impl Strategy<Value = Operation> {
    (
        "[A-Z][0-9]{1,4}",
        "[a-z0-9]{0,200}",
        prop::option::of("\"v[0-9]{1,3}\""),
    )
        .prop_map(|(target, text, token)| {
            let op = Operation::new(format!("Sheet1!{}", target), json!({ "values": [[text]] }));
            match token {
                Some(token) => op.with_precondition(token),
                None => op,
            }
        })
}

proptest! {
    /// Every group honours both bounds (a lone oversized operation excepted)
    #[test]
    fn packed_groups_respect_bounds(
        operations in prop::collection::vec(operation_strategy(), 0..60),
        max_count in 1usize..12,
        max_bytes in 1usize..1500,
    ) {
        let groups = pack(operations, max_count, max_bytes);
        for group in &groups {
            prop_assert!(!group.is_empty());
            prop_assert!(group.len() <= max_count);
            prop_assert!(group.estimated_byte_size <= max_bytes || group.len() == 1);

            let summed: usize = group.operations.iter().map(|(_, op)| op.estimated_size()).sum();
            prop_assert_eq!(summed, group.estimated_byte_size);
        }
    }

    /// Concatenating the groups gives back the submitted list, in order
    #[test]
    fn packing_preserves_order_and_identity(
        operations in prop::collection::vec(operation_strategy(), 0..60),
        max_count in 1usize..12,
        max_bytes in 1usize..1500,
    ) {
        let groups = pack(operations.clone(), max_count, max_bytes);
        let flattened: Vec<(usize, Operation)> = groups
            .into_iter()
            .flat_map(|g| g.operations)
            .collect();

        prop_assert_eq!(flattened.len(), operations.len());
        for (position, (index, op)) in flattened.into_iter().enumerate() {
            prop_assert_eq!(position, index);
            prop_assert_eq!(&op, &operations[index]);
        }
    }

    /// Groups are maximal: the first operation of each group would not have
    /// fit into the previous one
    #[test]
    fn packing_is_greedy(
        operations in prop::collection::vec(operation_strategy(), 1..60),
        max_count in 1usize..12,
        max_bytes in 1usize..1500,
    ) {
        let groups = pack(operations, max_count, max_bytes);
        for pair in groups.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            let first = next.operations[0].1.estimated_size();
            prop_assert!(
                prev.len() == max_count || prev.estimated_byte_size + first > max_bytes
            );
        }
    }
}
