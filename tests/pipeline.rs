// 该文件是 Qiushui （秋水） 项目的一部分。
// tests/pipeline.rs - 滤镜端到端测试
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use qiushui::{
  diff::{
    DiffOptions, FramePairBatch, LvpDiffFilter, PsnrEngine, SCORE_SUCCESS, SYNC_ANNOTATION_KEY,
    ScoringEngine,
  },
  dnn::{DNN_ANNOTATION_KEY, DnnOptions, LvpDnnFilter},
  error::{ErrorKind, FilterError},
  frame::{FrameError, HardwareSurface, PixelFormat, Rational, StreamGeometry, VideoFrame},
  input::FrameSource,
  model::{
    BackendKind, DeviceModelCache, ElementType, InferenceBackend, LoadedModel, ModelError,
    ModelOutput, ModelParams, TensorBuffer, TensorDescriptor,
  },
  output::FrameSink,
  sync::FrameSync,
  task::{DiffTask, DnnTask},
};

const WIDTH: usize = 16;
const HEIGHT: usize = 8;

fn gray_frame(pts: i64, value: u8) -> VideoFrame {
  VideoFrame::from_host(
    WIDTH,
    HEIGHT,
    PixelFormat::Rgb24,
    pts,
    vec![value; WIDTH * HEIGHT * 3],
  )
  .unwrap()
}

struct SyntheticSource {
  frames: VecDeque<VideoFrame>,
  fps: i64,
}

impl SyntheticSource {
  fn uniform(count: usize, fps: i64, value: u8) -> Self {
    Self {
      frames: (0..count).map(|i| gray_frame(i as i64, value)).collect(),
      fps,
    }
  }
}

impl Iterator for SyntheticSource {
  type Item = VideoFrame;

  fn next(&mut self) -> Option<Self::Item> {
    self.frames.pop_front()
  }
}

impl FrameSource for SyntheticSource {
  fn geometry(&self) -> StreamGeometry {
    StreamGeometry {
      width: WIDTH,
      height: HEIGHT,
      normalized_width: WIDTH,
      normalized_height: HEIGHT,
      frame_rate: Rational::new(self.fps, 1),
      time_base: Rational::new(1, self.fps),
    }
  }
}

/// 收集转发的帧，克隆后仍共享同一份列表
#[derive(Default, Clone)]
struct CollectSink {
  frames: Rc<RefCell<Vec<VideoFrame>>>,
}

impl CollectSink {
  fn frames(&self) -> std::cell::Ref<'_, Vec<VideoFrame>> {
    self.frames.borrow()
  }
}

impl FrameSink for CollectSink {
  type Error = std::io::Error;

  fn write_frame(&mut self, frame: &VideoFrame) -> Result<(), Self::Error> {
    let mut copy = VideoFrame::from_host(
      frame.width(),
      frame.height(),
      frame.format(),
      frame.pts(),
      frame.host_data().map(<[u8]>::to_vec).unwrap_or_default(),
    )
    .map_err(std::io::Error::other)?;
    for (k, v) in frame.metadata() {
      copy.set_metadata(k, v.clone());
    }
    self.frames.borrow_mut().push(copy);
    Ok(())
  }
}

struct CountingEngine {
  calls: Rc<Cell<usize>>,
  samples: Rc<Cell<usize>>,
}

impl ScoringEngine for CountingEngine {
  fn score(&self, batch: &mut FramePairBatch) -> i32 {
    self.calls.set(self.calls.get() + 1);
    self.samples.set(batch.sample_count());
    if let Some((_, _, _, finals)) = batch.scores_mut() {
      finals.fill(1.0);
    }
    SCORE_SUCCESS
  }
}

#[test]
fn diff_annotates_every_pair_and_scores_sampled_frames() {
  let dir = tempfile::tempdir().unwrap();
  let stats = dir.path().join("stats.log");
  let options = DiffOptions {
    stats_file: Some(stats.display().to_string()),
    ..Default::default()
  };
  let filter = LvpDiffFilter::new(&options, Box::new(PsnrEngine)).unwrap();

  let primary = SyntheticSource::uniform(200, 30, 100);
  let reference = SyntheticSource::uniform(200, 30, 110);
  let sink = CollectSink::default();
  let scores = DiffTask::default()
    .run(filter, primary, reference, sink.clone())
    .unwrap()
    .unwrap();

  assert_eq!(sink.frames().len(), 200);
  for (i, frame) in sink.frames().iter().enumerate() {
    assert_eq!(
      frame.metadata().get(SYNC_ANNOTATION_KEY),
      Some(&format!("{:04}", i + 1))
    );
  }

  assert_eq!(scores.len(), 5);
  let (psnr, mse) = (scores[0], scores[1]);
  assert!(mse > 50.0 && mse < 150.0, "mse = {}", mse);
  assert!(psnr > 20.0 && psnr < 40.0, "psnr = {}", psnr);

  let line = std::fs::read_to_string(&stats).unwrap();
  assert!(line.starts_with("feature(00):"));
  assert!(line.contains("feature(04):"));
  assert!(line.ends_with('\n'));
}

#[test]
fn diff_identical_streams_score_zero_error() {
  let filter = LvpDiffFilter::new(&DiffOptions::default(), Box::new(PsnrEngine)).unwrap();
  let scores = DiffTask::default()
    .run(
      filter,
      SyntheticSource::uniform(60, 30, 42),
      SyntheticSource::uniform(60, 30, 42),
      CollectSink::default(),
    )
    .unwrap()
    .unwrap();
  assert_eq!(scores[1], 0.0);
}

#[test]
fn diff_engine_runs_once_with_capped_samples() {
  let calls = Rc::new(Cell::new(0));
  let samples = Rc::new(Cell::new(0));
  let engine = CountingEngine {
    calls: Rc::clone(&calls),
    samples: Rc::clone(&samples),
  };
  let mut filter = LvpDiffFilter::new(&DiffOptions::default(), Box::new(engine)).unwrap();
  let primary = SyntheticSource::uniform(400, 30, 1);
  let reference = SyntheticSource::uniform(400, 30, 2);
  filter
    .configure(&primary.geometry(), &reference.geometry())
    .unwrap();

  for tick in FrameSync::new(primary, reference) {
    filter.process_tick(tick).unwrap();
  }
  assert_eq!(filter.nb_frames(), 400);
  assert_eq!(filter.sample_count(), 18);

  let scores = filter.finish().unwrap().unwrap();
  assert_eq!(scores, vec![1.0; 5]);
  assert_eq!(calls.get(), 1);
  assert_eq!(samples.get(), 18);
}

#[test]
fn diff_without_reference_passes_through() {
  let calls = Rc::new(Cell::new(0));
  let engine = CountingEngine {
    calls: Rc::clone(&calls),
    samples: Rc::new(Cell::new(0)),
  };
  let filter = LvpDiffFilter::new(&DiffOptions::default(), Box::new(engine)).unwrap();
  let reference = SyntheticSource::uniform(0, 30, 0);

  let sink = CollectSink::default();
  let scores = DiffTask::default()
    .run(filter, SyntheticSource::uniform(10, 30, 5), reference, sink.clone())
    .unwrap();

  assert!(scores.is_none());
  assert_eq!(calls.get(), 0);
  assert_eq!(sink.frames().len(), 10);
  assert!(sink.frames().iter().all(|f| f.metadata().is_empty()));
}

#[test]
fn diff_dropped_filter_still_scores() {
  let calls = Rc::new(Cell::new(0));
  let engine = CountingEngine {
    calls: Rc::clone(&calls),
    samples: Rc::new(Cell::new(0)),
  };
  {
    let mut filter = LvpDiffFilter::new(&DiffOptions::default(), Box::new(engine)).unwrap();
    let primary = SyntheticSource::uniform(5, 30, 1);
    let reference = SyntheticSource::uniform(5, 30, 1);
    filter
      .configure(&primary.geometry(), &reference.geometry())
      .unwrap();
    for tick in FrameSync::new(primary, reference) {
      filter.process_tick(tick).unwrap();
    }
  }
  assert_eq!(calls.get(), 1);
}

// 推理部分使用的模拟后端

#[derive(Default)]
struct MockBackend {
  loads: Rc<Cell<usize>>,
  executes: Rc<Cell<usize>>,
  devices: RefCell<Vec<u32>>,
  /// 第 n 次执行返回错误，预热算第 1 次
  fail_on_call: Option<usize>,
}

struct MockModel {
  descriptor: TensorDescriptor,
  executes: Rc<Cell<usize>>,
  fail_on_call: Option<usize>,
}

const MOCK_INPUT: TensorDescriptor = TensorDescriptor {
  width: 8,
  height: 8,
  channels: 3,
  element_type: ElementType::Float32,
};

impl InferenceBackend for MockBackend {
  fn kind(&self) -> BackendKind {
    BackendKind::Native
  }

  fn set_device(&self, device_id: u32) -> Result<(), ModelError> {
    self.devices.borrow_mut().push(device_id);
    Ok(())
  }

  fn load_model(&self, _path: &str, _device_id: u32) -> Result<Box<dyn LoadedModel>, ModelError> {
    self.loads.set(self.loads.get() + 1);
    Ok(Box::new(MockModel {
      descriptor: MOCK_INPUT,
      executes: Rc::clone(&self.executes),
      fail_on_call: self.fail_on_call,
    }))
  }
}

impl LoadedModel for MockModel {
  fn get_input(&self, name: &str) -> Result<TensorDescriptor, ModelError> {
    if name == "data" {
      Ok(self.descriptor)
    } else {
      Err(ModelError::InputNotFound(name.to_string()))
    }
  }

  fn set_input_output(
    &mut self,
    _input: &TensorDescriptor,
    _input_name: &str,
    _output_names: &[&str],
  ) -> Result<(), ModelError> {
    Ok(())
  }

  /// 输出输入张量的均值
  fn execute(&self, input: &TensorBuffer, _batch_size: usize) -> Result<ModelOutput, ModelError> {
    self.executes.set(self.executes.get() + 1);
    if self.fail_on_call == Some(self.executes.get()) {
      return Err(ModelError::Invalid("设备执行失败".to_string()));
    }
    let TensorBuffer::Float32(values) = input else {
      return Err(ModelError::Invalid("需要 float32 输入".to_string()));
    };
    let mean = values.iter().sum::<f32>() / values.len() as f32;
    Ok(ModelOutput::new(vec![mean]))
  }
}

fn dnn_options(sample: u32, threshold: Option<f32>) -> DnnOptions {
  DnnOptions {
    model: "mock.model".to_string(),
    input: "data".to_string(),
    output: "prob".to_string(),
    sample,
    threshold,
    ..Default::default()
  }
}

fn register(backend: &MockBackend, options: &DnnOptions) -> DeviceModelCache {
  let mut cache = DeviceModelCache::new();
  cache
    .register_devices(backend, &options.params(), &options.device_list())
    .unwrap();
  cache
}

#[test]
fn dnn_annotates_bright_frame_above_threshold() {
  let backend = MockBackend::default();
  let options = dnn_options(1, Some(0.5));
  let cache = register(&backend, &options);
  // 预热
  assert_eq!(backend.executes.get(), 1);

  let filter = LvpDnnFilter::bind(&options, &cache).unwrap();
  let input = (0..20).map(|i| gray_frame(i, if i == 7 { 230 } else { 0 }));
  let sink = CollectSink::default();
  let executed = DnnTask::default().run(filter, input, sink.clone()).unwrap();

  assert_eq!(executed, 20);
  assert_eq!(backend.executes.get(), 21);
  assert_eq!(sink.frames().len(), 20);
  for frame in sink.frames().iter() {
    let text = frame.metadata().get(DNN_ANNOTATION_KEY);
    if frame.pts() == 7 {
      assert_eq!(text.map(String::as_str), Some("probability 0.90"));
    } else {
      assert!(text.is_none());
    }
  }
}

#[test]
fn dnn_sample_stride_limits_executions() {
  let backend = MockBackend::default();
  let options = dnn_options(5, None);
  let cache = register(&backend, &options);
  let mut filter = LvpDnnFilter::bind(&options, &cache).unwrap();

  let mut annotated = Vec::new();
  for i in 0..20 {
    let frame = filter.filter_frame(gray_frame(i, 0)).unwrap();
    if frame.metadata().contains_key(DNN_ANNOTATION_KEY) {
      annotated.push(i);
    }
  }
  assert_eq!(filter.executed(), 4);
  assert_eq!(annotated, vec![4, 9, 14, 19]);
}

#[test]
fn dnn_registration_is_idempotent() {
  let backend = MockBackend::default();
  let options = dnn_options(1, None);
  let mut cache = register(&backend, &options);
  cache
    .register_devices(&backend, &options.params(), "0")
    .unwrap();
  assert_eq!(backend.loads.get(), 1);
  assert_eq!(*backend.devices.borrow(), vec![0]);
  assert_eq!(cache.len(), 1);

  let other = DnnOptions {
    model: "other.model".to_string(),
    ..options.clone()
  };
  let err = LvpDnnFilter::bind(&other, &cache).err().unwrap();
  assert_eq!(err.kind(), ErrorKind::Configuration);

  let unregistered = DnnOptions {
    device: 3,
    ..options
  };
  assert!(matches!(
    LvpDnnFilter::bind(&unregistered, &cache),
    Err(FilterError::Cache(_))
  ));
}

#[test]
fn dnn_failed_registration_clears_cache() {
  let backend = MockBackend::default();
  let mut cache = DeviceModelCache::new();
  cache
    .register_devices(&backend, &ModelParams::new("mock.model", "data", "prob"), "0")
    .unwrap();
  let result = cache.register_devices(
    &backend,
    &ModelParams::new("mock.model", "missing", "prob"),
    "1,2",
  );
  assert!(result.is_err());
  assert!(cache.is_empty());
}

struct FakeSurface {
  fail: bool,
}

impl HardwareSurface for FakeSurface {
  fn transfer_formats(&self) -> Vec<PixelFormat> {
    vec![PixelFormat::Rgb24]
  }

  fn download(&self, format: PixelFormat) -> Result<Box<[u8]>, FrameError> {
    if self.fail {
      return Err(FrameError::DownloadFailed("设备忙".to_string()));
    }
    Ok(vec![230; format.buffer_size(WIDTH, HEIGHT)].into_boxed_slice())
  }
}

#[test]
fn dnn_download_failure_only_drops_frame() {
  let backend = MockBackend::default();
  let options = dnn_options(1, Some(0.5));
  let cache = register(&backend, &options);
  let mut filter = LvpDnnFilter::bind(&options, &cache).unwrap();

  let broken = VideoFrame::from_hardware(
    WIDTH,
    HEIGHT,
    PixelFormat::Nv12,
    0,
    Box::new(FakeSurface { fail: true }),
  );
  let err = filter.filter_frame(broken).err().unwrap();
  assert!(err.is_frame_local());

  let working = VideoFrame::from_hardware(
    WIDTH,
    HEIGHT,
    PixelFormat::Nv12,
    1,
    Box::new(FakeSurface { fail: false }),
  );
  let frame = filter.filter_frame(working).unwrap();
  assert_eq!(
    frame.metadata().get(DNN_ANNOTATION_KEY).map(String::as_str),
    Some("probability 0.90")
  );
  assert_eq!(filter.executed(), 1);
}

/// 第 6 帧（pts 5）推理失败
fn failing_backend() -> MockBackend {
  MockBackend {
    fail_on_call: Some(1 + 6),
    ..Default::default()
  }
}

fn dnn_frames() -> impl Iterator<Item = VideoFrame> {
  (0..20).map(|i| gray_frame(i, if i == 12 { 230 } else { 0 }))
}

#[test]
fn dnn_execute_failure_only_drops_frame() {
  let backend = failing_backend();
  let options = dnn_options(1, None);
  let cache = register(&backend, &options);
  let mut filter = LvpDnnFilter::bind(&options, &cache).unwrap();

  for frame in dnn_frames() {
    let pts = frame.pts();
    match filter.filter_frame(frame) {
      Ok(frame) => {
        let expected = if pts == 12 { "0.90," } else { "0.00," };
        assert_eq!(
          frame.metadata().get(DNN_ANNOTATION_KEY).map(String::as_str),
          Some(expected)
        );
      }
      Err(err) => {
        assert_eq!(pts, 5);
        assert!(err.is_frame_local());
        assert!(matches!(err, FilterError::Execute(_)));
      }
    }
  }
  assert_eq!(filter.executed(), 19);
}

#[test]
fn dnn_task_continues_after_execute_failure() {
  let backend = failing_backend();
  let options = dnn_options(1, Some(0.5));
  let cache = register(&backend, &options);
  let filter = LvpDnnFilter::bind(&options, &cache).unwrap();

  let sink = CollectSink::default();
  let executed = DnnTask::default()
    .run(filter, dnn_frames(), sink.clone())
    .unwrap();

  assert_eq!(executed, 19);
  assert_eq!(backend.executes.get(), 21);
  let frames = sink.frames();
  assert_eq!(frames.len(), 19);
  assert!(frames.iter().all(|f| f.pts() != 5));
  let annotated: Vec<i64> = frames
    .iter()
    .filter(|f| f.metadata().contains_key(DNN_ANNOTATION_KEY))
    .map(VideoFrame::pts)
    .collect();
  assert_eq!(annotated, vec![12]);
}
