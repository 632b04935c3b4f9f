// Every execution variant against the naive reference, plus the launches each one issues.
mod common;

use common::*;
use qconv::device::KernelId;
use qconv::{
    ActivationKind, ArchitectureProfile, ConvDescriptor, ConvVariant, Dim4, EngineConfig, HostDevice, Padding,
};

fn check(device: &mut HostDevice, case: &ConvCase, config: &EngineConfig, variant: ConvVariant, name: &str) {
    init_logging();
    let (conv, got, expected) = run_case(device, case, config, 7);
    assert_eq!(conv.variant(), variant, "{}: variant", name);
    assert_outputs_match(&got, &expected, name);
}

#[test]
fn test_gemm_asymmetric_pad_stride() {
    let mut device = HostDevice::default();
    let case = ConvCase::new(
        Dim4::new(1, 3, 7, 7),
        5,
        ConvDescriptor::new(3, 3)
            .with_stride(2, 2)
            .with_padding(Padding::new(1, 2, 0, 1)),
    );
    assert_eq!(case.output_dims(), Dim4::new(1, 5, 3, 4));
    check(&mut device, &case, &EngineConfig::default(), ConvVariant::Gemm, "gemm asymmetric");
    assert_eq!(device.launched(KernelId::PadOpt), 1);
    assert_eq!(device.launched(KernelId::AlignWeightGemm), 1);
}

#[test]
fn test_gemm_batch_relu6() {
    let mut device = HostDevice::default();
    let case = ConvCase::new(
        Dim4::new(2, 4, 5, 6),
        6,
        ConvDescriptor::new(2, 3).with_activation(ActivationKind::Relu6),
    );
    check(&mut device, &case, &EngineConfig::default(), ConvVariant::Gemm, "gemm batch relu6");
}

#[test]
fn test_gemm_int8_grouped() {
    let mut device = HostDevice::default();
    let case = ConvCase::new(
        Dim4::new(1, 6, 5, 5),
        9,
        ConvDescriptor::new(3, 3).with_padding(Padding::uniform(1)).with_group(3),
    )
    .signed();
    check(&mut device, &case, &EngineConfig::default(), ConvVariant::Gemm, "gemm int8 grouped");
    assert!(launched_names(&device).iter().all(|n| n.starts_with("SIGNED")));
}

#[test]
fn test_gemm1xn_pointwise_high_end() {
    let mut device = HostDevice::new(ArchitectureProfile::high_end());
    let case = ConvCase::new(Dim4::new(1, 6, 5, 5), 7, ConvDescriptor::new(1, 1));
    check(&mut device, &case, &EngineConfig::default(), ConvVariant::Gemm1xN, "1xN pointwise");
    assert_eq!(device.launched(KernelId::Convert1x1), 1);
    assert_eq!(device.launched(KernelId::Gemm1xN), 1);
    assert_eq!(device.launched(KernelId::WeightOffset), 1);
    let gemm = device.launches().iter().find(|l| l.kernel == KernelId::Gemm1xN).unwrap();
    assert_eq!(gemm.work.global, [1, 2, 24]);
    assert_eq!(gemm.work.local, Some([1, 2, 24]));
}

#[test]
fn test_gemm1xn_small_pad_stride2() {
    let mut device = HostDevice::new(ArchitectureProfile::high_end());
    let case = ConvCase::new(
        Dim4::new(1, 2, 6, 6),
        3,
        ConvDescriptor::new(3, 3).with_stride(2, 2).with_padding(Padding::uniform(1)),
    );
    check(&mut device, &case, &EngineConfig::default(), ConvVariant::Gemm1xN, "1xN 3x3 small pad");
    let convert = device
        .launches()
        .iter()
        .find(|l| l.kernel == KernelId::Convert3x3SmallPad)
        .unwrap();
    assert_eq!(convert.work.local, Some([24, 1, 1]));
}

#[test]
fn test_gemm1xn_valhall_block8() {
    let mut device = HostDevice::new(ArchitectureProfile::valhall());
    let case = ConvCase::new(
        Dim4::new(1, 4, 8, 8),
        6,
        ConvDescriptor::new(3, 3).with_padding(Padding::uniform(1)),
    );
    let config = EngineConfig::default().with_variant(ConvVariant::Gemm1xN);
    check(&mut device, &case, &config, ConvVariant::Gemm1xN, "1xN valhall");
    assert_eq!(device.launched(KernelId::Convert3x3Pad1Valhall), 1);
    assert_eq!(device.launched(KernelId::Gemm1xNBlock8), 1);
    let convert = device
        .launches()
        .iter()
        .find(|l| l.kernel == KernelId::Convert3x3Pad1Valhall)
        .unwrap();
    assert_eq!(convert.work.global, [16, 48, 1]);
}

#[test]
fn test_gemm1xn_dilated() {
    let mut device = HostDevice::default();
    let case = ConvCase::new(
        Dim4::new(1, 3, 9, 9),
        4,
        ConvDescriptor::new(3, 3).with_dilation(2, 2).with_padding(Padding::uniform(2)),
    );
    check(&mut device, &case, &EngineConfig::default(), ConvVariant::Gemm1xN, "1xN dilated");
    assert_eq!(device.launched(KernelId::DilationInit), 1);
    assert_eq!(device.launched(KernelId::Dilation), 1);
    assert_eq!(device.launched(KernelId::ConvertWithPad), 1);
}

#[test]
fn test_gemm1xn_grouped_int8() {
    let mut device = HostDevice::new(ArchitectureProfile::high_end());
    let case = ConvCase::new(
        Dim4::new(2, 4, 4, 5),
        6,
        ConvDescriptor::new(3, 3).with_padding(Padding::new(0, 1, 2, 1)).with_group(2),
    )
    .signed();
    let config = EngineConfig::default().with_variant(ConvVariant::Gemm1xN);
    check(&mut device, &case, &config, ConvVariant::Gemm1xN, "1xN grouped int8");
    assert_eq!(device.launched(KernelId::Gemm1xN), 2);
    // int8 always takes the generic convert, one launch per group
    assert_eq!(device.launched(KernelId::ConvertWithPad), 2);
    assert_eq!(device.launched(KernelId::Convert3x3SmallPad), 0);
}

#[test]
fn test_gemm1xn_int8_pointwise_skips_1x1_convert() {
    let mut device = HostDevice::new(ArchitectureProfile::high_end());
    let case = ConvCase::new(Dim4::new(1, 6, 5, 5), 7, ConvDescriptor::new(1, 1)).signed();
    check(&mut device, &case, &EngineConfig::default(), ConvVariant::Gemm1xN, "1xN int8 pointwise");
    assert_eq!(device.launched(KernelId::Convert1x1), 0);
    assert!(launched_names(&device).contains(&"SIGNEDalign_convert_withpad".to_string()));
}

#[test]
fn test_gemm1xn_valhall_small_pad_narrow() {
    let mut device = HostDevice::new(ArchitectureProfile::valhall());
    let case = ConvCase::new(
        Dim4::new(1, 2, 5, 5),
        3,
        ConvDescriptor::new(3, 3).with_padding(Padding::uniform(1)),
    );
    let config = EngineConfig::default().with_variant(ConvVariant::Gemm1xN);
    check(&mut device, &case, &config, ConvVariant::Gemm1xN, "1xN valhall small pad");
    // width 5 rules out the blocked pad-1 convert
    assert_eq!(device.launched(KernelId::Convert3x3Pad1Valhall), 0);
    let convert = device
        .launches()
        .iter()
        .find(|l| l.kernel == KernelId::Convert3x3SmallPadValhall)
        .unwrap();
    assert_eq!(convert.work.global, [64, 2, 1]);
    assert_eq!(convert.work.local, Some([64, 1, 1]));
}

#[test]
fn test_gemm1xn_valhall_wide_kernels() {
    let cases = [
        (Dim4::new(1, 2, 8, 8), 5, 2, KernelId::Convert5x5Pad2Valhall, [16, 64, 1]),
        (Dim4::new(1, 1, 8, 8), 9, 4, KernelId::Convert9x9Pad4Valhall, [16, 96, 1]),
    ];
    for (input, k, pad, kernel, global) in cases {
        let mut device = HostDevice::new(ArchitectureProfile::valhall());
        let case = ConvCase::new(
            input,
            3,
            ConvDescriptor::new(k, k)
                .with_padding(Padding::uniform(pad))
                .with_activation(ActivationKind::Relu),
        );
        let config = EngineConfig::default().with_variant(ConvVariant::Gemm1xN);
        check(&mut device, &case, &config, ConvVariant::Gemm1xN, kernel.name());
        let convert = device.launches().iter().find(|l| l.kernel == kernel).unwrap();
        assert_eq!(convert.work.global, global);
        assert_eq!(convert.work.local, Some([16, 16, 1]));
    }
}

#[test]
fn test_direct_kernels() {
    let mut device = HostDevice::default();
    let case = ConvCase::new(
        Dim4::new(1, 5, 6, 8),
        9,
        ConvDescriptor::new(3, 3).with_padding(Padding::uniform(1)),
    );
    check(&mut device, &case, &EngineConfig::default(), ConvVariant::Direct, "direct 3x3");
    let direct = device.launches().iter().find(|l| l.kernel == KernelId::Direct3x3).unwrap();
    assert_eq!(direct.work.global, [16, 6, 2]);
    assert_eq!(direct.work.local, Some([16, 1, 1]));

    let mut device = HostDevice::default();
    let case = ConvCase::new(
        Dim4::new(2, 3, 4, 16),
        4,
        ConvDescriptor::new(5, 5)
            .with_padding(Padding::uniform(2))
            .with_activation(ActivationKind::Relu),
    );
    check(&mut device, &case, &EngineConfig::default(), ConvVariant::Direct, "direct 5x5");
    assert_eq!(device.launched(KernelId::Direct5x5), 1);
    assert_eq!(device.launched(KernelId::PadCopyAlignC4), 1);
}

#[test]
fn test_direct_wide_kernels() {
    let cases = [
        (Dim4::new(1, 3, 8, 8), 7, 5, KernelId::Direct7x7, [16, 8, 1]),
        (Dim4::new(1, 6, 10, 8), 9, 10, KernelId::Direct9x9, [16, 10, 2]),
    ];
    for (input, k, out_channels, kernel, global) in cases {
        let mut device = HostDevice::default();
        let case = ConvCase::new(
            input,
            out_channels,
            ConvDescriptor::new(k, k).with_padding(Padding::uniform(k as i32 / 2)),
        );
        check(&mut device, &case, &EngineConfig::default(), ConvVariant::Direct, kernel.name());
        let direct = device.launches().iter().find(|l| l.kernel == kernel).unwrap();
        assert_eq!(direct.work.global, global);
        assert_eq!(direct.work.local, Some([16, 1, 1]));
    }
}

#[test]
fn test_depthwise_pad_merge() {
    let cases = [
        (ConvDescriptor::new(3, 3), Dim4::new(1, 4, 6, 6), KernelId::Depthwise3x3S1PadMerge),
        (
            ConvDescriptor::new(3, 3).with_stride(2, 2),
            Dim4::new(1, 3, 7, 7),
            KernelId::Depthwise3x3S2PadMerge,
        ),
        (
            ConvDescriptor::new(3, 3).with_dilation(2, 2),
            Dim4::new(1, 2, 7, 7),
            KernelId::Depthwise3x3S1D2PadMerge,
        ),
    ];
    for (desc, input, kernel) in cases {
        let pad = if desc.is_dilated() { 2 } else { 1 };
        let desc = desc.with_padding(Padding::uniform(pad)).with_group(input.c);
        let mut device = HostDevice::default();
        let case = ConvCase::new(input, input.c, desc);
        check(&mut device, &case, &EngineConfig::default(), ConvVariant::Depthwise, kernel.name());
        assert_eq!(device.launched(kernel), 1);
        assert_eq!(device.launched(KernelId::DepthwisePad), 0);
        assert_eq!(device.launched(KernelId::Dilation), 0);
    }
}

#[test]
fn test_depthwise_multiplier_quad() {
    let mut device = HostDevice::default();
    let case = ConvCase::new(
        Dim4::new(1, 3, 5, 5),
        6,
        ConvDescriptor::new(3, 3)
            .with_padding(Padding::uniform(1))
            .with_group(3)
            .with_depth_multiplier(2),
    );
    check(&mut device, &case, &EngineConfig::default(), ConvVariant::Depthwise, "depthwise 4P");
    assert_eq!(device.launched(KernelId::DepthwisePad), 1);
    let quad = device
        .launches()
        .iter()
        .find(|l| l.kernel == KernelId::Depthwise3x3S1Quad)
        .unwrap();
    assert_eq!(quad.work.global, [3, 3, 16]);
}

#[test]
fn test_depthwise_generic_dilated() {
    let mut device = HostDevice::default();
    let case = ConvCase::new(
        Dim4::new(1, 3, 7, 7),
        3,
        ConvDescriptor::new(2, 2).with_dilation(3, 3).with_group(3),
    );
    check(&mut device, &case, &EngineConfig::default(), ConvVariant::Depthwise, "depthwise dilated");
    assert_eq!(device.launched(KernelId::DepthwiseGeneric), 1);
    assert_eq!(device.launched(KernelId::Dilation), 1);
}

#[test]
fn test_depthwise_int8() {
    let mut device = HostDevice::default();
    let case = ConvCase::new(
        Dim4::new(2, 4, 6, 5),
        4,
        ConvDescriptor::new(3, 3)
            .with_padding(Padding::new(1, 0, 1, 2))
            .with_group(4)
            .with_activation(ActivationKind::Relu),
    )
    .signed();
    check(&mut device, &case, &EngineConfig::default(), ConvVariant::Depthwise, "depthwise int8");
    let names = launched_names(&device);
    assert_eq!(names, vec!["SIGNEDpad".to_string(), "SIGNEDdepthwise_conv".to_string()]);
}

#[test]
fn test_depthwise_unequal_tail() {
    for signed in [false, true] {
        let mut device = HostDevice::default();
        let mut case = ConvCase::new(
            Dim4::new(1, 3, 4, 4),
            5,
            ConvDescriptor::new(3, 3).with_padding(Padding::uniform(1)).with_group(3),
        );
        if signed {
            case = case.signed();
        }
        assert_eq!(case.weight_dims(), Dim4::new(3, 1, 3, 3));
        check(&mut device, &case, &EngineConfig::default(), ConvVariant::Depthwise, "depthwise unequal");
        let tail = device
            .launches()
            .iter()
            .find(|l| l.kernel == KernelId::DepthwiseUnequal)
            .unwrap();
        assert_eq!(tail.work.global, [1, 2, 16]);
        assert_eq!(tail.work.local, Some([1, 2, 16]));
    }
}

#[test]
fn test_per_channel() {
    let mut device = HostDevice::default();
    let case = ConvCase::new(
        Dim4::new(1, 4, 6, 6),
        3,
        ConvDescriptor::new(3, 3).with_padding(Padding::uniform(1)),
    )
    .per_channel(vec![0.01, 0.02, 0.005]);
    check(&mut device, &case, &EngineConfig::default(), ConvVariant::PerChannel, "per-channel");
    assert_eq!(device.launched(KernelId::PerChannelConv), 1);

    let mut device = HostDevice::default();
    let case = ConvCase::new(
        Dim4::new(1, 4, 5, 5),
        4,
        ConvDescriptor::new(3, 3)
            .with_dilation(2, 2)
            .with_padding(Padding::uniform(2))
            .with_group(4),
    )
    .signed()
    .per_channel(vec![0.01, 0.015, 0.02, 0.004]);
    check(&mut device, &case, &EngineConfig::default(), ConvVariant::PerChannel, "per-channel depthwise int8");
    assert_eq!(device.launched(KernelId::PerChannelConv), 4);
}
