// Operator lifecycle: packing cache, graph-input weights, zero-point refold, error statuses.
mod common;

use common::*;
use qconv::device::{DeviceError, KernelId};
use qconv::{
    ArchitectureProfile, ConvDescriptor, ConvError, ConvVariant, Convolution, DataType, Dim4, EngineConfig,
    HostDevice, Padding, QuantizedTensor, Scale, Status,
};

fn init_status(device: &mut HostDevice, case: &ConvCase, f: &Fixture, config: &EngineConfig) -> Status {
    let result = Convolution::initialize(device, &f.input, &f.output, &f.weights, &f.bias, case.desc, config);
    Status::from(&result)
}

#[test]
fn test_static_weights_packed_once() {
    let mut device = HostDevice::default();
    let case = ConvCase::new(
        Dim4::new(1, 3, 6, 6),
        4,
        ConvDescriptor::new(3, 3).with_stride(2, 1).with_padding(Padding::uniform(1)),
    );
    let f = fixture(&mut device, &case, 21);
    let mut conv = Convolution::initialize(
        &mut device,
        &f.input,
        &f.output,
        &f.weights,
        &f.bias,
        case.desc,
        &EngineConfig::default(),
    )
    .unwrap();
    assert_eq!(device.launched(KernelId::AlignWeightGemm), 1);
    assert_eq!(device.launched(KernelId::GemmBlocked), 0);

    conv.execute(&mut device, &f.input, &f.output).unwrap();
    let first = f.output.read(&device).unwrap();
    conv.execute(&mut device, &f.input, &f.output).unwrap();
    assert_eq!(f.output.read(&device).unwrap(), first);
    assert_eq!(device.launched(KernelId::AlignWeightGemm), 1);
    assert_eq!(device.launched(KernelId::GemmBlocked), 2);
    assert_outputs_match(&first, &reference(&case, &f.input_data, &f.weight_data, &f.bias_data), "cached gemm");
}

#[test]
fn test_input_zero_point_change_refolds_bias() {
    let mut device = HostDevice::new(ArchitectureProfile::high_end());
    let case = ConvCase::new(
        Dim4::new(1, 5, 4, 4),
        3,
        ConvDescriptor::new(3, 3).with_padding(Padding::uniform(1)),
    );
    let f = fixture(&mut device, &case, 5);
    let mut conv = Convolution::initialize(
        &mut device,
        &f.input,
        &f.output,
        &f.weights,
        &f.bias,
        case.desc,
        &EngineConfig::default(),
    )
    .unwrap();
    assert_eq!(conv.variant(), ConvVariant::Gemm1xN);
    conv.execute(&mut device, &f.input, &f.output).unwrap();
    assert_eq!(device.launched(KernelId::WeightOffset), 1);

    let mut shifted = case.clone();
    shifted.zero_points.0 = 60;
    let input = QuantizedTensor::from_data(
        &mut device,
        case.input,
        DataType::UInt8,
        Scale::PerTensor(case.scales.0),
        60,
        &f.input_data,
    )
    .unwrap();
    conv.execute(&mut device, &input, &f.output).unwrap();
    assert_eq!(device.launched(KernelId::WeightOffset), 2);
    assert_outputs_match(
        &f.output.read(&device).unwrap(),
        &reference(&shifted, &f.input_data, &f.weight_data, &f.bias_data),
        "refolded 1xN",
    );
}

#[test]
fn test_dynamic_weights_repacked_each_call() {
    for (profile, variant, align) in [
        (ArchitectureProfile::generic(), ConvVariant::Gemm, KernelId::AlignWeightGemm),
        (ArchitectureProfile::high_end(), ConvVariant::Gemm1xN, KernelId::AlignWeight1xN),
        (ArchitectureProfile::generic(), ConvVariant::Direct, KernelId::AlignWeightDirect),
    ] {
        let mut device = HostDevice::new(profile);
        let case = ConvCase::new(
            Dim4::new(1, 2, 5, 8),
            3,
            ConvDescriptor::new(3, 3)
                .with_padding(Padding::uniform(1))
                .with_dynamic_weights(true, false),
        );
        let config = EngineConfig::default().with_variant(variant);
        let f = fixture(&mut device, &case, 8);
        let mut conv =
            Convolution::initialize(&mut device, &f.input, &f.output, &f.weights, &f.bias, case.desc, &config).unwrap();
        assert_eq!(device.launched(align), 0, "{}: nothing packed before execute", variant);
        conv.execute(&mut device, &f.input, &f.output).unwrap();
        assert_eq!(device.launched(align), 1);

        let mut rng = seeded(99);
        let new_weights = fill(&mut rng, case.weight_dims().count(), 0, 255);
        let new_bias = fill(&mut rng, 3, -100, 100);
        let weights = QuantizedTensor::from_data(
            &mut device,
            case.weight_dims(),
            DataType::UInt8,
            Scale::PerTensor(case.scales.1),
            case.zero_points.1,
            &new_weights,
        )
        .unwrap();
        let bias = QuantizedTensor::bias(&mut device, case.scales.0 * case.scales.1, &new_bias).unwrap();
        conv.set_inputs(&weights, &bias).unwrap();
        conv.execute(&mut device, &f.input, &f.output).unwrap();
        assert_eq!(device.launched(align), 2);
        assert_outputs_match(
            &f.output.read(&device).unwrap(),
            &reference(&case, &f.input_data, &new_weights, &new_bias),
            &format!("dynamic {}", variant),
        );
    }
}

#[test]
fn test_set_inputs_rejected_for_constant_weights() {
    let mut device = HostDevice::default();
    let case = ConvCase::new(Dim4::new(1, 2, 3, 3), 2, ConvDescriptor::new(1, 1));
    let f = fixture(&mut device, &case, 1);
    let mut conv = Convolution::initialize(
        &mut device,
        &f.input,
        &f.output,
        &f.weights,
        &f.bias,
        case.desc,
        &EngineConfig::default(),
    )
    .unwrap();
    let err = conv.set_inputs(&f.weights, &f.bias).unwrap_err();
    assert_eq!(err.status(), Status::InvalidParams);
}

#[test]
fn test_invalid_params() {
    let mut device = HostDevice::default();

    // group does not divide the input channels
    let case = ConvCase::new(Dim4::new(1, 4, 4, 4), 4, ConvDescriptor::new(1, 1));
    let f = fixture(&mut device, &case, 2);
    let grouped = ConvCase {
        desc: case.desc.with_group(3),
        ..case.clone()
    };
    assert_eq!(init_status(&mut device, &grouped, &f, &EngineConfig::default()), Status::InvalidParams);

    // declared output shape disagrees with the sizing formula
    let padded = ConvCase {
        desc: case.desc.with_padding(Padding::uniform(1)),
        ..case.clone()
    };
    let result = Convolution::initialize(
        &mut device,
        &f.input,
        &f.output,
        &f.weights,
        &f.bias,
        padded.desc,
        &EngineConfig::default(),
    );
    assert!(matches!(result, Err(ConvError::ShapeMismatch { .. })));
    assert_eq!(Status::from(&result), Status::InvalidParams);

    // empty input
    let empty = QuantizedTensor::new(&mut device, Dim4::new(1, 4, 0, 4), DataType::UInt8, Scale::PerTensor(0.5), 0)
        .unwrap();
    let result = Convolution::initialize(
        &mut device,
        &empty,
        &f.output,
        &f.weights,
        &f.bias,
        case.desc,
        &EngineConfig::default(),
    );
    assert_eq!(Status::from(&result), Status::InvalidParams);

    // per-channel weights cannot be forced onto a per-tensor variant
    let per_channel = case.clone().per_channel(vec![0.01; 4]);
    let f = fixture(&mut device, &per_channel, 3);
    let config = EngineConfig::default().with_variant(ConvVariant::Gemm);
    assert_eq!(init_status(&mut device, &per_channel, &f, &config), Status::InvalidParams);
}

#[test]
fn test_execute_shape_change_rejected() {
    let mut device = HostDevice::default();
    let case = ConvCase::new(Dim4::new(1, 2, 4, 4), 2, ConvDescriptor::new(1, 1));
    let f = fixture(&mut device, &case, 4);
    let mut conv = Convolution::initialize(
        &mut device,
        &f.input,
        &f.output,
        &f.weights,
        &f.bias,
        case.desc,
        &EngineConfig::default(),
    )
    .unwrap();
    let other = QuantizedTensor::new(&mut device, Dim4::new(1, 2, 5, 5), DataType::UInt8, Scale::PerTensor(0.5), 0)
        .unwrap();
    let result = conv.execute(&mut device, &other, &f.output);
    assert!(matches!(result, Err(ConvError::ShapeMismatch { .. })));
}

#[test]
fn test_direct_failures() {
    // no direct kernel for a non-square filter
    let mut device = HostDevice::default();
    let case = ConvCase::new(Dim4::new(1, 2, 6, 8), 2, ConvDescriptor::new(3, 1));
    let f = fixture(&mut device, &case, 6);
    let config = EngineConfig::default().with_variant(ConvVariant::Direct);
    let result = Convolution::initialize(&mut device, &f.input, &f.output, &f.weights, &f.bias, case.desc, &config);
    assert!(matches!(result, Err(ConvError::UnsupportedKernel { .. })));
    assert_eq!(Status::from(&result), Status::Failure);

    // the int8 catalog has no direct kernels
    let case = ConvCase::new(Dim4::new(1, 2, 6, 8), 2, ConvDescriptor::new(3, 3)).signed();
    let f = fixture(&mut device, &case, 6);
    let result = Convolution::initialize(&mut device, &f.input, &f.output, &f.weights, &f.bias, case.desc, &config);
    assert!(matches!(
        result,
        Err(ConvError::Device(DeviceError::UnknownKernel(..)))
    ));
    assert_eq!(Status::from(&result), Status::Failure);
}

#[test]
fn test_work_group_limit_fails() {
    let mut device = HostDevice::default().with_max_work_group_size(8);
    let case = ConvCase::new(Dim4::new(1, 2, 4, 4), 2, ConvDescriptor::new(1, 1));
    let f = fixture(&mut device, &case, 9);
    let result = Convolution::initialize(
        &mut device,
        &f.input,
        &f.output,
        &f.weights,
        &f.bias,
        case.desc,
        &EngineConfig::default(),
    );
    assert!(matches!(
        result,
        Err(ConvError::Device(DeviceError::WorkSize { .. }))
    ));
    assert_eq!(Status::from(&result), Status::Failure);
}

#[test]
fn test_dynamic_bias_with_constant_weights() {
    for (profile, variant, align) in [
        (ArchitectureProfile::generic(), ConvVariant::Gemm, KernelId::AlignWeightGemm),
        (ArchitectureProfile::high_end(), ConvVariant::Gemm1xN, KernelId::AlignWeight1xN),
        (ArchitectureProfile::generic(), ConvVariant::Direct, KernelId::AlignWeightDirect),
    ] {
        let mut device = HostDevice::new(profile);
        let case = ConvCase::new(
            Dim4::new(1, 3, 4, 8),
            5,
            ConvDescriptor::new(3, 3)
                .with_padding(Padding::uniform(1))
                .with_dynamic_weights(false, true),
        );
        let config = EngineConfig::default().with_variant(variant);
        let f = fixture(&mut device, &case, 12);
        let mut conv =
            Convolution::initialize(&mut device, &f.input, &f.output, &f.weights, &f.bias, case.desc, &config).unwrap();
        assert_eq!(device.launched(align), 0, "{}: bias input defers packing", variant);
        conv.execute(&mut device, &f.input, &f.output).unwrap();
        assert_outputs_match(
            &f.output.read(&device).unwrap(),
            &reference(&case, &f.input_data, &f.weight_data, &f.bias_data),
            &format!("bias input {}", variant),
        );

        let mut rng = seeded(13);
        let new_bias = fill(&mut rng, 5, -3000, 3000);
        let bias = QuantizedTensor::bias(&mut device, case.scales.0 * case.scales.1, &new_bias).unwrap();
        conv.set_inputs(&f.weights, &bias).unwrap();
        conv.execute(&mut device, &f.input, &f.output).unwrap();
        assert_eq!(device.launched(align), 2);
        assert_outputs_match(
            &f.output.read(&device).unwrap(),
            &reference(&case, &f.input_data, &f.weight_data, &new_bias),
            &format!("replaced bias {}", variant),
        );
    }
}

#[test]
fn test_release_frees_operator_buffers() {
    let cases = [
        (
            ArchitectureProfile::generic(),
            ConvVariant::Gemm,
            ConvCase::new(
                Dim4::new(1, 3, 7, 7),
                5,
                ConvDescriptor::new(3, 3)
                    .with_stride(2, 2)
                    .with_padding(Padding::new(1, 2, 0, 1)),
            ),
        ),
        (
            ArchitectureProfile::generic(),
            ConvVariant::Gemm1xN,
            ConvCase::new(
                Dim4::new(1, 3, 9, 9),
                4,
                ConvDescriptor::new(3, 3).with_dilation(2, 2).with_padding(Padding::uniform(2)),
            ),
        ),
        (
            ArchitectureProfile::generic(),
            ConvVariant::Direct,
            ConvCase::new(
                Dim4::new(1, 5, 6, 8),
                9,
                ConvDescriptor::new(3, 3).with_padding(Padding::uniform(1)),
            ),
        ),
        (
            ArchitectureProfile::generic(),
            ConvVariant::Depthwise,
            ConvCase::new(
                Dim4::new(1, 3, 7, 7),
                3,
                ConvDescriptor::new(2, 2).with_dilation(3, 3).with_group(3),
            ),
        ),
        (
            ArchitectureProfile::generic(),
            ConvVariant::PerChannel,
            ConvCase::new(
                Dim4::new(1, 4, 6, 6),
                3,
                ConvDescriptor::new(3, 3).with_padding(Padding::uniform(1)),
            )
            .per_channel(vec![0.01, 0.02, 0.005]),
        ),
    ];
    for (profile, variant, case) in cases {
        let mut device = HostDevice::new(profile);
        let f = fixture(&mut device, &case, 40);
        let before = device.live_buffers();
        let mut conv = Convolution::initialize(
            &mut device,
            &f.input,
            &f.output,
            &f.weights,
            &f.bias,
            case.desc,
            &EngineConfig::default(),
        )
        .unwrap();
        assert_eq!(conv.variant(), variant);
        conv.execute(&mut device, &f.input, &f.output).unwrap();
        assert!(device.live_buffers() > before, "{}: owns scratch buffers", variant);
        conv.release(&mut device).unwrap();
        assert_eq!(device.live_buffers(), before, "{}: every scratch buffer freed", variant);
        // caller tensors survive the operator
        assert_eq!(f.input.read(&device).unwrap(), f.input_data);
        assert!(f.output.read(&device).is_ok());
    }
}
