mod common;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use backdrop::{
    BackgroundImage, Capabilities, FrameDelivery, FramePattern, Platform, ProcessorConfig, ReadyState, StreamOptions,
    SyntheticCamera, TrackSettings, VirtualBackground, VirtualBackgroundOptions,
};
use common::{frame_where, half_model_engines, init_test_tracing, shared_engine, wait_until, FlakyEngine, BLUE};
use image::RgbaImage;

fn callback_platform(camera: Arc<SyntheticCamera>, engines: Arc<dyn backdrop::segmentation::EngineFactory>) -> Platform {
    Platform::new(camera, engines).with_capabilities(Capabilities {
        frame_stream: false,
        frame_callback: true,
    })
}

fn blue_background() -> VirtualBackgroundOptions {
    VirtualBackgroundOptions {
        image: BackgroundImage::Image(Arc::new(RgbaImage::from_pixel(2, 2, BLUE))),
    }
}

#[tokio::test]
async fn output_is_captured_at_the_configured_rate() {
    init_test_tracing();

    let camera = Arc::new(SyntheticCamera::new(32, 16).with_pattern(FramePattern::Paced { fps: 60 }));
    let platform = callback_platform(camera, half_model_engines(Arc::new(AtomicUsize::new(0)))).with_config(
        ProcessorConfig {
            capture_fps: 20,
            ..ProcessorConfig::default()
        },
    );
    let mut processor = VirtualBackground::new(platform, blue_background()).unwrap();
    processor.initialize().await.unwrap();
    assert_eq!(processor.delivery(), Some(FrameDelivery::FrameCallback));

    let stream = processor.create_processed_stream(StreamOptions::default()).await.unwrap();
    let output = stream.track().cloned().unwrap();
    assert_eq!(output.settings().frame_rate, Some(20.0));

    let mut reader = output.take_reader().unwrap();
    let composited = tokio::time::timeout(common::PIPELINE_TIMEOUT, async {
        loop {
            let frame = reader.next_frame().await.unwrap();
            if *frame.image().get_pixel(31, 8) == BLUE {
                break frame;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(composited.dimensions(), (32, 16));
    assert_eq!(composited.image().get_pixel(0, 8)[3], 255);

    // Output frames follow the capture clock, whatever the camera rate.
    let mut previous = composited.timestamp();
    for _ in 0..3 {
        let frame = reader.next_frame().await.unwrap();
        assert!(frame.timestamp() - previous >= Duration::from_millis(40));
        previous = frame.timestamp();
    }
}

#[tokio::test]
async fn resize_reallocates_working_surfaces() {
    init_test_tracing();

    let camera = Arc::new(
        SyntheticCamera::new(32, 16)
            .with_pattern(FramePattern::Paced { fps: 60 })
            .with_resize(6, 16, 32),
    );
    let platform = callback_platform(camera.clone(), half_model_engines(Arc::new(AtomicUsize::new(0))));
    let mut processor = VirtualBackground::new(platform, blue_background()).unwrap();
    processor.initialize().await.unwrap();

    let stream = processor.create_processed_stream(StreamOptions::default()).await.unwrap();
    let output = stream.track().cloned().unwrap();
    assert_eq!(output.settings(), TrackSettings {
        frame_rate: Some(30.0),
        ..TrackSettings::sized(32, 16)
    });

    // A composite at the new size has the background exactly where the new
    // geometry puts it, so no old-size mask leaked into it.
    let resized = frame_where(&output, |frame| frame.dimensions() == (16, 32)).await;
    for y in 0..32 {
        assert_eq!(*resized.image().get_pixel(15, y), BLUE);
        assert_eq!(resized.image().get_pixel(0, y)[3], 255);
    }
    assert_eq!(output.settings().width, Some(16));
    assert_eq!(output.settings().height, Some(32));
}

#[tokio::test]
async fn failed_frames_do_not_stall_the_loop() {
    init_test_tracing();

    let camera = Arc::new(SyntheticCamera::new(16, 16).with_pattern(FramePattern::Paced { fps: 60 }));
    let engine = Arc::new(FlakyEngine::failing_on(0..4));
    let platform = callback_platform(camera, shared_engine(engine.clone()));
    let mut processor = VirtualBackground::new(platform, blue_background()).unwrap();
    processor.initialize().await.unwrap();

    let stream = processor.create_processed_stream(StreamOptions::default()).await.unwrap();
    let output = stream.track().cloned().unwrap();

    let composited = frame_where(&output, |frame| *frame.image().get_pixel(15, 8) == BLUE).await;
    assert_eq!(composited.dimensions(), (16, 16));
    assert!(engine.sends() > 4);
}

#[tokio::test]
async fn dispose_stops_processing() {
    init_test_tracing();

    let camera = Arc::new(SyntheticCamera::new(16, 16).with_pattern(FramePattern::Paced { fps: 60 }));
    let engine = Arc::new(FlakyEngine::default());
    let platform = callback_platform(camera.clone(), shared_engine(engine.clone()));
    let mut processor = VirtualBackground::new(platform, blue_background()).unwrap();
    processor.initialize().await.unwrap();

    let mut stream = processor.create_processed_stream(StreamOptions::default()).await.unwrap();
    let output = stream.track().cloned().unwrap();
    wait_until(|| {
        let engine = engine.clone();
        async move { engine.sends() > 2 }
    })
    .await;

    stream.dispose().await.unwrap();
    processor.dispose().await.unwrap();
    assert_eq!(output.ready_state(), ReadyState::Ended);
    assert_eq!(camera.tracks()[0].ready_state(), ReadyState::Ended);

    let sends = engine.sends();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.sends(), sends);
}

#[tokio::test]
async fn second_stream_supersedes_the_first() {
    init_test_tracing();

    let camera = Arc::new(SyntheticCamera::new(16, 16).with_pattern(FramePattern::Paced { fps: 60 }));
    let platform = callback_platform(camera.clone(), half_model_engines(Arc::new(AtomicUsize::new(0))));
    let mut processor = VirtualBackground::new(platform, blue_background()).unwrap();
    processor.initialize().await.unwrap();

    let mut first = processor.create_processed_stream(StreamOptions::default()).await.unwrap();
    let first_output = first.track().cloned().unwrap();
    let second = processor.create_processed_stream(StreamOptions::default()).await.unwrap();
    let second_output = second.track().cloned().unwrap();

    wait_until(|| {
        let output = first_output.clone();
        async move { output.ready_state() == ReadyState::Ended }
    })
    .await;
    assert_eq!(camera.tracks()[0].ready_state(), ReadyState::Ended);

    first.dispose().await.unwrap();
    assert_eq!(camera.tracks()[1].ready_state(), ReadyState::Live);

    let composited = frame_where(&second_output, |frame| *frame.image().get_pixel(15, 8) == BLUE).await;
    assert_eq!(composited.dimensions(), (16, 16));
    assert_eq!(second_output.ready_state(), ReadyState::Live);

    processor.dispose().await.unwrap();
    assert_eq!(camera.tracks()[1].ready_state(), ReadyState::Ended);
}
