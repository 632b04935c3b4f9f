// Shared fixtures: seeded operand generation and a naive reference convolution.
#![allow(dead_code)]

use qconv::kernels::{calculate_activation_range, requantize, RequantParam};
use qconv::ops::selector::is_depthwise;
use qconv::{
    ComputeDevice, ConvDescriptor, Convolution, DataType, Dim4, EngineConfig, HostDevice, Precision,
    QuantizedTensor, Scale,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Route library logs to the test writer; `RUST_LOG=qconv=trace` shows every launch.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Seeded generator so every fixture is reproducible.
pub fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// `len` values drawn uniformly from `lo..=hi`.
pub fn fill(rng: &mut StdRng, len: usize, lo: i32, hi: i32) -> Vec<i32> {
    (0..len).map(|_| rng.gen_range(lo..=hi)).collect()
}

#[derive(Debug, Clone)]
pub struct ConvCase {
    pub input: Dim4,
    pub out_channels: usize,
    pub desc: ConvDescriptor,
    pub data_type: DataType,
    /// input, weight, output
    pub zero_points: (i32, i32, i32),
    /// input, weight, output
    pub scales: (f64, f64, f64),
    pub channel_scales: Option<Vec<f64>>,
}

impl ConvCase {
    pub fn new(input: Dim4, out_channels: usize, desc: ConvDescriptor) -> Self {
        Self {
            input,
            out_channels,
            desc,
            data_type: DataType::UInt8,
            zero_points: (121, 134, 128),
            scales: (0.5, 0.01, 8.0),
            channel_scales: None,
        }
    }

    pub fn signed(mut self) -> Self {
        self.data_type = DataType::Int8;
        self.zero_points = (-7, 3, -2);
        self
    }

    pub fn per_channel(mut self, scales: Vec<f64>) -> Self {
        self.channel_scales = Some(scales);
        self
    }

    pub fn output_dims(&self) -> Dim4 {
        let (h, w) = self.desc.output_size(self.input.h, self.input.w).unwrap();
        Dim4::new(self.input.n, self.out_channels, h, w)
    }

    pub fn is_depthwise(&self) -> bool {
        is_depthwise(self.input, self.output_dims(), &self.desc)
    }

    pub fn weight_dims(&self) -> Dim4 {
        let d = &self.desc;
        if self.is_depthwise() && self.channel_scales.is_none() {
            Dim4::new(self.input.c * d.depth_multiplier, 1, d.kernel_h, d.kernel_w)
        } else {
            Dim4::new(self.out_channels, self.input.c / d.group, d.kernel_h, d.kernel_w)
        }
    }
}

pub struct Fixture {
    pub input: QuantizedTensor,
    pub output: QuantizedTensor,
    pub weights: QuantizedTensor,
    pub bias: QuantizedTensor,
    pub input_data: Vec<i32>,
    pub weight_data: Vec<i32>,
    pub bias_data: Vec<i32>,
}

pub fn fixture(device: &mut HostDevice, case: &ConvCase, seed: u64) -> Fixture {
    let mut rng = seeded(seed);
    let (lo, hi) = case.data_type.range();
    let (izp, wzp, ozp) = case.zero_points;
    let (is, ws, os) = case.scales;
    let w_dims = case.weight_dims();
    let input_data = fill(&mut rng, case.input.count(), lo, hi);
    let weight_data = fill(&mut rng, w_dims.count(), lo, hi);
    let bias_data = fill(&mut rng, case.out_channels, -2000, 2000);
    let w_scale = match &case.channel_scales {
        Some(v) => Scale::PerChannel(v.clone()),
        None => Scale::PerTensor(ws),
    };
    let input = QuantizedTensor::from_data(device, case.input, case.data_type, Scale::PerTensor(is), izp, &input_data)
        .unwrap();
    let weights = QuantizedTensor::from_data(device, w_dims, case.data_type, w_scale, wzp, &weight_data).unwrap();
    let bias = QuantizedTensor::bias(device, is * ws, &bias_data).unwrap();
    let output = QuantizedTensor::new(device, case.output_dims(), case.data_type, Scale::PerTensor(os), ozp).unwrap();
    Fixture {
        input,
        output,
        weights,
        bias,
        input_data,
        weight_data,
        bias_data,
    }
}

/// Direct loop over `Σ (x - input_zp)(w - weight_zp) + bias`, requantized
/// with the same fixed-point pipeline the kernels use.
pub fn reference(case: &ConvCase, input: &[i32], weights: &[i32], bias: &[i32]) -> Vec<i32> {
    let d = &case.desc;
    let out = case.output_dims();
    let inp = case.input;
    let (izp, wzp, ozp) = case.zero_points;
    let (is, ws, os) = case.scales;
    let precision = Precision::from_data_type(case.data_type).unwrap();
    let (act_min, act_max) = calculate_activation_range(d.activation, os, ozp, precision);
    let depthwise = case.is_depthwise() && case.channel_scales.is_none();
    let in_per_group = inp.c / d.group;
    let out_per_group = if depthwise { d.depth_multiplier } else { out.c / d.group };
    let fed = if depthwise { out.c.min(inp.c * d.depth_multiplier) } else { out.c };

    let mut result = vec![0; out.count()];
    for n in 0..out.n {
        for oc in 0..out.c {
            let requant = match &case.channel_scales {
                Some(v) => RequantParam::from_ratio(is * v[oc] / os),
                None => RequantParam::from_ratio(is * ws / os),
            };
            for oh in 0..out.h {
                for ow in 0..out.w {
                    let mut acc = bias[oc];
                    if oc < fed {
                        let g = oc / out_per_group;
                        let channels = if depthwise { 1 } else { in_per_group };
                        for icg in 0..channels {
                            let ic = if depthwise { g } else { g * in_per_group + icg };
                            for ky in 0..d.kernel_h {
                                let ih = (oh * d.stride_h + ky * d.dilation_h) as i64 - d.padding.top as i64;
                                if ih < 0 || ih >= inp.h as i64 {
                                    continue;
                                }
                                for kx in 0..d.kernel_w {
                                    let iw = (ow * d.stride_w + kx * d.dilation_w) as i64 - d.padding.left as i64;
                                    if iw < 0 || iw >= inp.w as i64 {
                                        continue;
                                    }
                                    let x = input[((n * inp.c + ic) * inp.h + ih as usize) * inp.w + iw as usize];
                                    let w = weights[((oc * channels + icg) * d.kernel_h + ky) * d.kernel_w + kx];
                                    acc += (x - izp) * (w - wzp);
                                }
                            }
                        }
                    }
                    result[((n * out.c + oc) * out.h + oh) * out.w + ow] = requantize(acc, requant, ozp, act_min, act_max);
                }
            }
        }
    }
    result
}

/// Initialize, execute once and return the operator, its output and the reference output.
pub fn run_case(
    device: &mut HostDevice,
    case: &ConvCase,
    config: &EngineConfig,
    seed: u64,
) -> (Convolution, Vec<i32>, Vec<i32>) {
    let f = fixture(device, case, seed);
    let mut conv =
        Convolution::initialize(device, &f.input, &f.output, &f.weights, &f.bias, case.desc, config).unwrap();
    conv.execute(device, &f.input, &f.output).unwrap();
    let got = f.output.read(device).unwrap();
    let expected = reference(case, &f.input_data, &f.weight_data, &f.bias_data);
    (conv, got, expected)
}

pub fn assert_outputs_match(got: &[i32], expected: &[i32], name: &str) {
    assert_eq!(got.len(), expected.len(), "{}: length mismatch", name);
    let mismatches = got.iter().zip(expected).filter(|(a, b)| a != b).count();
    if mismatches > 0 {
        let first = got.iter().zip(expected).position(|(a, b)| a != b).unwrap();
        println!("Got:      {:?}", &got[first..(first + 8).min(got.len())]);
        println!("Expected: {:?}", &expected[first..(first + 8).min(expected.len())]);
        panic!("{}: {} of {} outputs differ, first at {}", name, mismatches, got.len(), first);
    }
    let distinct = {
        let mut v = got.to_vec();
        v.sort_unstable();
        v.dedup();
        v.len()
    };
    println!("{} PASSED: {} outputs, {} distinct values", name, got.len(), distinct);
}

pub fn launched_names(device: &HostDevice) -> Vec<String> {
    device.launches().iter().map(|l| l.name()).collect()
}

pub fn buffer_of(device: &HostDevice, tensor: &QuantizedTensor) -> Vec<i32> {
    device.read_buffer(tensor.buffer()).unwrap()
}
