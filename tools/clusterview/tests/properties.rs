use clusterview::filter::{apply, StructuredFilter, ViewFilter};
use clusterview::model::{Entity, Guest, GuestKey, GuestType};
use clusterview::selection::{reconcile, Cursor};
use proptest::prelude::*;

const NODES: [&str; 3] = ["pve1", "pve2", "pve3"];
const STATUSES: [&str; 3] = ["running", "stopped", "paused"];

fn guest_strategy(vmid: u32) -> impl Strategy<Value = Guest> {
    (
        "[a-z]{1,8}",
        0..NODES.len(),
        0..STATUSES.len(),
        any::<bool>(),
        "(prod|dev|web|db)?",
    )
        .prop_map(move |(name, node, status, lxc, tags)| {
            let guest_type = if lxc { GuestType::Lxc } else { GuestType::Qemu };
            let mut guest = Guest::new("lab", NODES[node], vmid, name, guest_type, STATUSES[status]);
            guest.tags = tags;
            guest
        })
}

fn guests_strategy() -> impl Strategy<Value = Vec<Guest>> {
    prop::collection::btree_set(100u32..160, 0..12).prop_flat_map(|vmids| {
        vmids
            .into_iter()
            .map(guest_strategy)
            .collect::<Vec<_>>()
    })
}

fn filter_strategy() -> impl Strategy<Value = ViewFilter> {
    (
        "[a-zA-Z]{0,3}",
        prop::sample::select(vec!["", "Any", "running", "STOPPED"]),
        prop::sample::select(vec!["", "qemu", "lxc"]),
        prop::sample::select(vec!["", "pve1", "pve3"]),
    )
        .prop_map(|(text, status, kind, node)| ViewFilter {
            text,
            structured: StructuredFilter {
                status: status.to_string(),
                kind: kind.to_string(),
                node: node.to_string(),
                tag_contains: String::new(),
            },
        })
}

proptest! {
    #[test]
    fn filtering_never_mutates_or_reorders_originals(
        guests in guests_strategy(),
        filter in filter_strategy(),
    ) {
        let before = guests.clone();
        let rows = apply(&guests, &filter);

        prop_assert_eq!(&guests, &before);
        prop_assert!(rows.windows(2).all(|pair| pair[0] < pair[1]));
        for (idx, guest) in guests.iter().enumerate() {
            prop_assert_eq!(rows.contains(&idx), filter.matches(guest));
        }
    }

    #[test]
    fn refiltering_the_filtered_rows_keeps_all_of_them(
        guests in guests_strategy(),
        filter in filter_strategy(),
    ) {
        let filtered = apply(&guests, &filter)
            .into_iter()
            .map(|idx| guests[idx].clone())
            .collect::<Vec<_>>();
        prop_assert_eq!(apply(&filtered, &filter).len(), filtered.len());
    }

    #[test]
    fn text_filter_ignores_case(guests in guests_strategy(), text in "[a-z]{1,3}") {
        let lower = apply(&guests, &ViewFilter::text(text.clone()));
        let upper = apply(&guests, &ViewFilter::text(text.to_uppercase()));
        prop_assert_eq!(lower, upper);
    }

    #[test]
    fn empty_filter_shows_every_row(guests in guests_strategy()) {
        let rows = apply(&guests, &ViewFilter::default());
        prop_assert_eq!(rows, (0..guests.len()).collect::<Vec<_>>());
    }

    #[test]
    fn reconciled_cursor_is_always_in_range(
        guests in guests_strategy(),
        focused_vmid in 100u32..160,
        node in 0..NODES.len(),
    ) {
        let focused = GuestKey::new("lab", NODES[node], focused_vmid);
        let cursor = reconcile(Some(&focused), &guests);
        match cursor {
            Cursor::Empty => prop_assert!(guests.is_empty()),
            Cursor::Row(idx) => {
                prop_assert!(idx < guests.len());
                if let Some(expected) = guests.iter().position(|g| g.vmid == focused_vmid) {
                    prop_assert_eq!(idx, expected);
                    prop_assert!(guests[idx].continues(&focused));
                }
            }
        }
    }

    #[test]
    fn cursor_steps_stay_inside_the_list(
        start in 0usize..20,
        delta in -25isize..25,
        len in 0usize..15,
    ) {
        match Cursor::for_len(start, len).step(delta, len) {
            Cursor::Empty => prop_assert_eq!(len, 0),
            Cursor::Row(idx) => prop_assert!(idx < len),
        }
    }
}
