use anyhow::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::io::{Cursor, Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};

use roastwatch::detect::{Detector, DetectorSettings, RawDetection, ScriptedBackend};
use roastwatch::{
    shared_memory_uri, CaptureMethod, DetectionService, DetectorBackend, ErrorKind, ImageStore,
    JobStatus, LiveStage, RemoteCamera, SqliteJobStore,
};

fn service(
    backend: impl DetectorBackend + 'static,
    remote: RemoteCamera,
) -> Result<(DetectionService, TempDir)> {
    let dir = tempdir()?;
    let store = SqliteJobStore::open(&shared_memory_uri())?;
    let service = DetectionService::new(
        Arc::new(store),
        ImageStore::new(dir.path())?,
        Arc::new(Detector::new(backend, DetectorSettings::default())),
    )
    .with_remote(remote);
    Ok((service, dir))
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb([90, 60, 30]));
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

fn raw(class_index: usize, confidence: f32, x1: f32, y1: f32, x2: f32, y2: f32) -> RawDetection {
    RawDetection {
        class_index,
        confidence,
        x1,
        y1,
        x2,
        y2,
    }
}

/// Reports one bean covering exactly the frame it was given.
struct WholeFrameBackend;

impl DetectorBackend for WholeFrameBackend {
    fn name(&self) -> &'static str {
        "whole-frame"
    }

    fn detect(&mut self, _pixels: &[u8], width: u32, height: u32) -> Result<Vec<RawDetection>> {
        Ok(vec![raw(0, 0.9, 0.0, 0.0, width as f32, height as f32)])
    }
}

#[test]
fn live_capture_keeps_confidence_order() -> Result<()> {
    let backend = ScriptedBackend::new(vec![
        raw(1, 0.81, 10.0, 10.0, 60.0, 60.0),
        raw(3, 0.93, 100.0, 100.0, 150.0, 150.0),
    ]);
    let (service, _dir) = service(backend, RemoteCamera::default())?;
    let stage = LiveStage::new();

    let ingest = stage.ingest(&service, &png(200, 200))?;
    assert_eq!(ingest.result.classes(), vec!["dark_roast", "light_roast"]);

    let job = stage.capture(&service)?;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.capture_method, CaptureMethod::LiveStream);
    assert_eq!(job.detections_count, 2);
    assert_eq!(job.detection_classes, vec!["dark_roast", "light_roast"]);
    assert_eq!(job.confidence_scores, vec![0.93, 0.81]);

    let stored = service.get(job.id)?;
    assert_eq!(stored, job);
    assert!(service.result_image(job.id).is_ok());
    Ok(())
}

#[test]
fn remote_timeout_creates_no_job() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let release = Arc::new(AtomicBool::new(false));
    let release_thread = release.clone();
    let silent = thread::spawn(move || {
        // hold the connection open without ever answering
        if let Ok((_stream, _)) = listener.accept() {
            while !release_thread.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(20));
            }
        }
    });

    let remote = RemoteCamera::new(addr.to_string(), Duration::from_millis(300));
    let (service, _dir) = service(ScriptedBackend::new(vec![]), remote)?;

    let started = Instant::now();
    let err = service.capture_direct(None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteSource);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(service.store().stats()?.total_detections, 0);

    release.store(true, Ordering::SeqCst);
    silent.join().expect("silent camera thread");
    Ok(())
}

#[test]
fn remote_refused_connection_is_reported() -> Result<()> {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?
    };
    let remote = RemoteCamera::new("192.0.2.1:5000", Duration::from_secs(2));
    let (service, _dir) = service(ScriptedBackend::new(vec![]), remote)?;

    let err = service
        .capture_direct(Some(addr.to_string().as_str()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteSource);
    assert_eq!(service.store().stats()?.total_detections, 0);
    Ok(())
}

#[test]
fn remote_frame_is_recorded_with_its_origin() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let frame = png(64, 48);
    let camera = thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                frame.len()
            );
            let _ = stream.write_all(head.as_bytes());
            let _ = stream.write_all(&frame);
        }
    });

    let remote = RemoteCamera::new(addr.to_string(), Duration::from_secs(5));
    let backend = ScriptedBackend::new(vec![raw(2, 0.7, 4.0, 4.0, 30.0, 30.0)]);
    let (service, _dir) = service(backend, remote)?;

    let (job, analysis) = service.capture_direct(None)?;
    camera.join().expect("camera thread");

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.capture_method, CaptureMethod::DirectCapture);
    assert_eq!(job.origin_address.as_deref(), Some(addr.to_string().as_str()));
    assert_eq!(job.detection_classes, vec!["medium_roast"]);
    assert_eq!(analysis.annotated.dimensions(), (64, 48));
    Ok(())
}

#[test]
fn concurrent_ingests_leave_one_coherent_snapshot() -> Result<()> {
    const WRITERS: u32 = 8;
    let (service, _dir) = service(WholeFrameBackend, RemoteCamera::default())?;
    let service = Arc::new(service);
    let stage = Arc::new(LiveStage::new());
    let barrier = Arc::new(Barrier::new(WRITERS as usize + 1));
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let stage = Arc::clone(&stage);
        let barrier = Arc::clone(&barrier);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            barrier.wait();
            let mut last_seen = 0;
            while !done.load(Ordering::SeqCst) {
                if let Some(entry) = stage.peek().expect("peek") {
                    assert!(entry.sequence() >= last_seen);
                    assert_eq!(entry.raw().dimensions(), entry.annotated().dimensions());
                    assert_eq!(entry.result().objects[0].bbox.width, entry.raw().width());
                    last_seen = entry.sequence();
                }
            }
        })
    };

    let writers: Vec<_> = (0..WRITERS)
        .map(|i| {
            let service = Arc::clone(&service);
            let stage = Arc::clone(&stage);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let width = 16 + i;
                barrier.wait();
                let ingest = stage.ingest(&service, &png(width, 16)).expect("ingest");
                // each caller sees its own frame's result
                assert_eq!(ingest.result.count(), 1);
                assert_eq!(ingest.result.objects[0].bbox.width, width);
                assert_eq!(ingest.result.objects[0].bbox.height, 16);
                let jpeg = STANDARD
                    .decode(&ingest.annotated_base64)
                    .expect("base64 frame");
                let annotated = image::load_from_memory(&jpeg).expect("jpeg frame");
                assert_eq!(annotated.width(), width);
                width
            })
        })
        .collect();
    let widths: Vec<u32> = writers
        .into_iter()
        .map(|w| w.join().expect("writer"))
        .collect();
    done.store(true, Ordering::SeqCst);
    reader.join().expect("reader");

    let entry = stage.latest()?;
    assert_eq!(entry.sequence(), WRITERS as u64);
    assert!(widths.contains(&entry.raw().width()));
    assert_eq!(entry.result().objects[0].bbox.width, entry.raw().width());
    assert_eq!(entry.raw().dimensions(), entry.annotated().dimensions());
    assert_eq!(service.store().stats()?.total_detections, 0);
    Ok(())
}

#[test]
fn concurrent_detection_runs_single_flight() -> Result<()> {
    let backend = ScriptedBackend::new(vec![raw(1, 0.8, 2.0, 2.0, 20.0, 20.0)]);
    let (service, _dir) = service(backend, RemoteCamera::default())?;
    let service = Arc::new(service);
    let job = service.upload("beans.png", &png(32, 32))?;

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let service = Arc::clone(&service);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                service.run_detection(job.id).map(|_| ()).map_err(|e| e.kind())
            })
        })
        .collect();
    let outcomes: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("runner"))
        .collect();

    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .filter_map(|o| o.as_ref().err())
        .all(|kind| *kind == ErrorKind::Conflict));
    let stored = service.get(job.id)?;
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.detections_count, 1);
    Ok(())
}
