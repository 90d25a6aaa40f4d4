use proptest::prelude::*;

use inline_widgets::markers::find;
use inline_widgets::{
    DEFAULT_MAX_PENDING, ReplayBuffer, StreamProcessor, WIDGET_END, WIDGET_START, WidgetId,
    WidgetRegistry, widget_link,
};

#[derive(Debug, Clone)]
enum Segment {
    Text(Vec<u8>),
    Widget(Vec<u8>),
}

/// Bytes that can never form a marker on their own.
fn arb_plain() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>().prop_filter("no ESC", |b| *b != 0x1b), 0..48)
}

fn arb_segment() -> impl Strategy<Value = Segment> {
    prop_oneof![
        3 => arb_plain().prop_map(Segment::Text),
        1 => arb_plain().prop_map(Segment::Widget),
    ]
}

fn render(segments: &[Segment]) -> Vec<u8> {
    let mut out = Vec::new();
    for seg in segments {
        match seg {
            Segment::Text(t) => out.extend_from_slice(t),
            Segment::Widget(p) => {
                out.extend_from_slice(WIDGET_START);
                out.extend_from_slice(p);
                out.extend_from_slice(WIDGET_END);
            }
        }
    }
    out
}

/// What a viewer should see: every block replaced by its link, ids from 1.
fn expected_view(segments: &[Segment]) -> (Vec<u8>, Vec<Vec<u8>>) {
    let mut out = Vec::new();
    let mut payloads = Vec::new();
    for seg in segments {
        match seg {
            Segment::Text(t) => out.extend_from_slice(t),
            Segment::Widget(p) => {
                payloads.push(p.clone());
                out.extend(widget_link(WidgetId(payloads.len() as u64)));
            }
        }
    }
    (out, payloads)
}

fn splits_start_marker(input: &[u8], at: usize) -> bool {
    let mut from = 0;
    while let Some(rel) = find(&input[from..], WIDGET_START) {
        let start = from + rel;
        if at > start && at < start + WIDGET_START.len() {
            return true;
        }
        from = start + 1;
    }
    false
}

fn run(chunks: &[&[u8]]) -> (Vec<u8>, Vec<Vec<u8>>) {
    let mut proc = StreamProcessor::default();
    let mut stored = Vec::new();
    let mut data = Vec::new();
    for chunk in chunks {
        let out = proc.extract(chunk, |payload| {
            stored.push(payload);
            WidgetId(stored.len() as u64)
        });
        data.extend(out.data);
    }
    assert!(proc.pending().is_empty());
    (data, stored)
}

proptest! {
    #[test]
    fn extraction_matches_model(segments in prop::collection::vec(arb_segment(), 0..12)) {
        let input = render(&segments);
        let (data, stored) = run(&[input.as_slice()]);
        let (want_data, want_payloads) = expected_view(&segments);
        prop_assert_eq!(data, want_data);
        prop_assert_eq!(stored, want_payloads);
    }

    #[test]
    fn split_invariance(
        segments in prop::collection::vec(arb_segment(), 1..12),
        cut in any::<prop::sample::Index>(),
    ) {
        let input = render(&segments);
        let at = cut.index(input.len() + 1);
        prop_assume!(!splits_start_marker(&input, at));

        let whole = run(&[input.as_slice()]);
        let (head, tail) = input.split_at(at);
        let split = run(&[head, tail]);
        prop_assert_eq!(whole, split);
    }

    #[test]
    fn input_without_start_marker_is_untouched(input in arb_plain()) {
        let reg = WidgetRegistry::new();
        let mut proc = StreamProcessor::default();
        let out = proc.process(&input, &reg);
        prop_assert_eq!(out.data, input);
        prop_assert!(out.widgets.is_empty());
        prop_assert!(proc.pending().is_empty());
        prop_assert!(reg.is_empty());
    }

    #[test]
    fn replay_is_suffix_of_everything_appended(
        chunks in prop::collection::vec(arb_plain(), 0..32),
        limit in 1usize..256,
    ) {
        let mut buf = ReplayBuffer::with_limit(limit);
        let mut reference = Vec::new();
        for chunk in &chunks {
            buf.append(chunk);
            reference.extend_from_slice(chunk);
            prop_assert!(buf.len() <= limit);
        }
        let keep = reference.len().min(limit);
        prop_assert_eq!(buf.as_slice(), &reference[reference.len() - keep..]);
    }

    #[test]
    fn processor_replay_never_exceeds_cap(
        segments in prop::collection::vec(arb_segment(), 0..24),
        limit in 16usize..512,
    ) {
        let reg = WidgetRegistry::new();
        let mut proc = StreamProcessor::new(limit, DEFAULT_MAX_PENDING);
        for seg in &segments {
            proc.process(&render(std::slice::from_ref(seg)), &reg);
            prop_assert!(proc.replay().len() <= limit);
        }
    }
}
