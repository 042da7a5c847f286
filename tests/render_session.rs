use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use pagestream::pipeline::{FailureKind, PipelineError, SharedRegion};
use pagestream::test_utils::{
    RenderGate, ScriptedEngine, drain, next_frame, payload_page, test_settings, thread_producer,
};
use pagestream::{PageCanvas, PageLayout, PipelineSettings, PollOutcome, RenderFailurePolicy, SessionOutcome};

fn ten_page_gated(gate: &RenderGate) -> ScriptedEngine {
    ScriptedEngine::new()
        .with_document("ten.pdf", 10)
        .gated(gate.clone())
}

/// Lets pages `0..count` render one at a time and receives each frame.
fn step_through(gate: &RenderGate, producer: &mut pagestream::PageProducer, count: usize) -> Vec<usize> {
    (0..count)
        .map(|expected| {
            assert_eq!(gate.wait_started(), expected);
            gate.proceed();
            next_frame(producer).page_index
        })
        .collect()
}

#[test]
fn three_page_document_arrives_in_order_and_region_is_released() {
    let engine = ScriptedEngine::new().with_document("three.pdf", 3);
    let (mut producer, launches) = thread_producer(engine, test_settings());

    assert_eq!(producer.start("three.pdf").unwrap(), 3);
    let region_name = producer.session().unwrap().region_name().to_string();

    let (pages, report) = drain(&mut producer);
    assert_eq!(pages, vec![0, 1, 2]);
    assert_eq!(report.outcome, SessionOutcome::Completed);
    assert_eq!((report.delivered, report.remaining), (3, 0));

    let stopped = producer.stop().expect("session was alive");
    assert_eq!(stopped.outcome, SessionOutcome::Completed);
    assert!(producer.session().is_none());
    assert!(!producer.is_alive());
    assert_eq!(launches.load(Ordering::SeqCst), 1);

    let err = SharedRegion::open(&region_name).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn unreadable_document_fails_before_any_launch() {
    let engine = ScriptedEngine::new().with_document("good.pdf", 1);
    let (mut producer, launches) = thread_producer(engine, test_settings());

    let err = producer.start("corrupt.pdf").unwrap_err();

    assert!(matches!(err, PipelineError::DocumentOpen(_)));
    assert_eq!(launches.load(Ordering::SeqCst), 0);
    assert!(producer.session().is_none());
    assert!(matches!(producer.poll(), Ok(PollOutcome::Idle)));
}

#[test]
fn focus_request_jumps_then_wraps_to_lowest_pending() {
    let gate = RenderGate::new();
    let (mut producer, _) = thread_producer(ten_page_gated(&gate), test_settings());
    producer.start("ten.pdf").unwrap();

    let mut order = step_through(&gate, &mut producer, 2);

    assert_eq!(gate.wait_started(), 2);
    producer.request_focus(5);
    gate.open_all();

    let (rest, report) = drain(&mut producer);
    order.extend(rest);

    assert_eq!(order, vec![0, 1, 2, 5, 6, 7, 8, 9, 3, 4]);
    assert_eq!(report.outcome, SessionOutcome::Completed);
}

#[test]
fn stop_during_render_interrupts_before_next_page() {
    let gate = RenderGate::new();
    let engine = ten_page_gated(&gate);
    let log = engine.render_log();
    let (mut producer, _) = thread_producer(engine, test_settings());
    producer.start("ten.pdf").unwrap();

    assert_eq!(step_through(&gate, &mut producer, 4), vec![0, 1, 2, 3]);
    assert_eq!(gate.wait_started(), 4);

    let releaser = {
        let gate = gate.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            gate.open_all();
        })
    };
    let report = producer.stop().expect("session was alive");
    releaser.join().unwrap();

    assert_eq!(report.outcome, SessionOutcome::Interrupted);
    assert_eq!(report.delivered, 4);
    assert_eq!(report.remaining, 6);
    assert!(log.pages().iter().all(|&page| page < 5), "{:?}", log.pages());
    assert!(producer.session().is_none());
}

#[test]
fn oversized_frame_ends_session_as_failed() {
    let engine = ScriptedEngine::new()
        .with_document("big.pdf", 3)
        .oversized_page("big.pdf", 1, 100_000);
    let (mut producer, _) = thread_producer(engine, test_settings());
    producer.start("big.pdf").unwrap();

    let (pages, report) = drain(&mut producer);

    assert_eq!(pages, vec![0]);
    assert_eq!(
        report.outcome,
        SessionOutcome::Failed {
            kind: FailureKind::BufferOverflow,
            page: Some(1)
        }
    );
    assert_eq!(report.remaining, 2);
}

#[test]
fn second_start_while_alive_is_rejected() {
    let gate = RenderGate::new();
    let (mut producer, launches) = thread_producer(ten_page_gated(&gate), test_settings());
    producer.start("ten.pdf").unwrap();
    assert_eq!(gate.wait_started(), 0);

    assert!(matches!(
        producer.start("ten.pdf"),
        Err(PipelineError::SessionAlive)
    ));
    assert_eq!(launches.load(Ordering::SeqCst), 1);
    assert!(producer.is_alive());

    gate.open_all();
    producer.stop();
    assert!(!producer.is_alive());
}

#[test]
fn render_failure_aborts_by_default() {
    let engine = ScriptedEngine::new()
        .with_document("bad.pdf", 4)
        .failing_page("bad.pdf", 2);
    let (mut producer, _) = thread_producer(engine, test_settings());
    producer.start("bad.pdf").unwrap();

    let (pages, report) = drain(&mut producer);

    assert_eq!(pages, vec![0, 1]);
    assert_eq!(
        report.outcome,
        SessionOutcome::Failed {
            kind: FailureKind::Render,
            page: Some(2)
        }
    );
}

#[test]
fn render_failure_can_skip_the_page() {
    let engine = ScriptedEngine::new()
        .with_document("bad.pdf", 4)
        .failing_page("bad.pdf", 2);
    let settings = PipelineSettings {
        on_render_error: RenderFailurePolicy::SkipPage,
        ..test_settings()
    };
    let (mut producer, _) = thread_producer(engine, settings);
    producer.start("bad.pdf").unwrap();

    let (pages, report) = drain(&mut producer);

    assert_eq!(pages, vec![0, 1, 3]);
    assert_eq!(report.outcome, SessionOutcome::Completed);
    assert_eq!(report.skipped, 1);
}

#[test]
fn every_page_delivered_once_despite_focus_jumps() {
    let engine = ScriptedEngine::new().with_document("long.pdf", 25);
    let (mut producer, _) = thread_producer(engine, test_settings());
    producer.start("long.pdf").unwrap();

    let mut seen = vec![];
    let report = loop {
        match producer.poll().unwrap() {
            PollOutcome::Frame(frame) => {
                seen.push(frame.page_index);
                if seen.len() % 4 == 0 {
                    producer.request_focus((seen.len() * 7) % 25);
                }
            }
            PollOutcome::Finished(report) => break report,
            PollOutcome::Pending => thread::sleep(Duration::from_millis(1)),
            PollOutcome::Idle => panic!("session stopped polling"),
        }
    };

    let unique: BTreeSet<usize> = seen.iter().copied().collect();
    assert_eq!(seen.len(), 25);
    assert_eq!(unique, (0..25).collect());
    assert_eq!(report.outcome, SessionOutcome::Completed);
}

#[test]
fn slow_consumer_reads_intact_frames() {
    let engine = ScriptedEngine::new().with_document("slow.pdf", 6);
    let (mut producer, _) = thread_producer(engine, test_settings());
    producer.start("slow.pdf").unwrap();

    for expected in 0..6 {
        thread::sleep(Duration::from_millis(5));
        let frame = next_frame(&mut producer);
        assert_eq!(frame.page_index, expected);
        assert_eq!(payload_page(&frame.bytes), Some(expected));
        assert!(frame.bytes[4..].iter().all(|&b| b == expected as u8));
    }

    let (rest, report) = drain(&mut producer);
    assert!(rest.is_empty());
    assert!(report.is_success());
}

#[test]
fn delivered_png_frames_are_placed_on_canvas() {
    let engine = ScriptedEngine::new()
        .with_document("scan.pdf", 3)
        .png_pages("scan.pdf");
    let (mut producer, _) = thread_producer(engine, test_settings());
    let mut canvas = PageCanvas::new(PageLayout {
        page_width: 40,
        page_height: 60,
        margin: 5,
    });

    let page_count = producer.start("scan.pdf").unwrap();
    canvas.clear(page_count);
    for _ in 0..page_count {
        let frame = next_frame(&mut producer);
        let placed = canvas.insert(&frame).unwrap();
        assert_eq!(placed.image.dimensions(), (40, 60));
    }

    assert_eq!(canvas.len(), 3);
    assert_eq!(canvas.get(2).map(|p| p.y), Some(130));
    assert_eq!(canvas.focus_for_scroll(70), Some(1));
}
