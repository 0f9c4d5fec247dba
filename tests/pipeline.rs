//! End-to-end decode runs on the host backend.
//!
//! Device kernels are replaced by small host closures so that the data each
//! stage hands to the next can be checked sample by sample.

use std::cell::RefCell;
use std::rc::Rc;

use gpuj2k_rs::compute::host::Command;
use gpuj2k_rs::compute::{ComputeBackend, KernelArg};
use gpuj2k_rs::constants::{
    DC_SHIFT_INVERSE_ENTRY, DC_SHIFT_INVERSE_PROGRAM, DEQUANTIZE_LOSSLESS_ENTRY,
    DEQUANTIZE_LOSSLESS_PROGRAM, DEQUANTIZE_LOSSY_ENTRY, DEQUANTIZE_LOSSY_PROGRAM, DWT_ENTRY,
    ENTROPY_ENTRY, ENTROPY_PROGRAM,
};
use gpuj2k_rs::jpeg2000::color::{ColorTransform, SampleRange};
use gpuj2k_rs::jpeg2000::entropy::CodeBlockRecord;
use gpuj2k_rs::jpeg2000::image::J2kTile;
use gpuj2k_rs::jpeg2000::packet::{PrecinctState, decode_packet};
use gpuj2k_rs::{
    DecodeParameters, DecodePipeline, HostBackend, ImageParameters, J2kError, J2kImage,
    PipelineOptions, TileStage, WaveletKind,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn build(image: ImageParameters, params: DecodeParameters) -> J2kImage {
    J2kImage::new(&image, &params).unwrap()
}

fn sample(tag: u8, x: usize, y: usize) -> i32 {
    tag as i32 * 4 + ((x + y) % 4) as i32 - 40
}

/// Writes `sample(tag, x, y)` for every sample of every block, `tag` being the
/// first codestream byte, scaled to the block's magnitude bits.
fn register_entropy(backend: &mut HostBackend) {
    backend.register_kernel(ENTROPY_PROGRAM, ENTROPY_ENTRY, |inv| {
        let codestreams = inv.bytes(inv.buffer(1)?)?.to_vec();
        let slot = inv.int(2)? as usize;
        let records: Vec<CodeBlockRecord> = bytemuck::pod_collect_to_vec(inv.bytes(inv.buffer(3)?)?);
        let count = inv.int(4)? as usize;
        let coefficients = inv.buffer(5)?;
        for (i, record) in records.iter().take(count).enumerate() {
            let tag = codestreams[i * slot];
            let shift = 31 - record.magnitude_bits as u32;
            for y in 0..record.height as usize {
                let row: Vec<i32> = (0..record.width as usize)
                    .map(|x| sample(tag, x, y) << shift)
                    .collect();
                let offset = record.coefficients_offset as usize + y * record.nominal_width as usize;
                inv.write_i32(coefficients, offset, &row)?;
            }
        }
        Ok(())
    });
}

fn register_lossless_dequantize(backend: &mut HostBackend) {
    backend.register_kernel(DEQUANTIZE_LOSSLESS_PROGRAM, DEQUANTIZE_LOSSLESS_ENTRY, |inv| {
        let staging = inv.read_i32(inv.buffer(0)?)?;
        let [w, h] = inv.int2(1)?;
        let plane = inv.buffer(2)?;
        let offset = inv.int(3)? as usize;
        let [pitch, _] = inv.int2(4)?;
        let shift = inv.int(6)?;
        for y in 0..h as usize {
            let row: Vec<i32> = staging[y * w as usize..(y + 1) * w as usize]
                .iter()
                .map(|v| v >> shift)
                .collect();
            inv.write_i32(plane, offset + y * pitch as usize, &row)?;
        }
        Ok(())
    });
}

/// Scales each staged coefficient by the convert factor into an f32 plane.
fn register_lossy_dequantize(backend: &mut HostBackend) {
    backend.register_kernel(DEQUANTIZE_LOSSY_PROGRAM, DEQUANTIZE_LOSSY_ENTRY, |inv| {
        let staging = inv.read_i32(inv.buffer(0)?)?;
        let [w, h] = inv.int2(1)?;
        let plane = inv.buffer(2)?;
        let offset = inv.int(3)? as usize;
        let [pitch, _] = inv.int2(4)?;
        let convert_factor = inv.float(6)?;
        for y in 0..h as usize {
            let row: Vec<f32> = staging[y * w as usize..(y + 1) * w as usize]
                .iter()
                .map(|&v| v as f32 * convert_factor)
                .collect();
            inv.write_f32(plane, offset + y * pitch as usize, &row)?;
        }
        Ok(())
    });
}

fn register_level_shift(backend: &mut HostBackend) {
    backend.register_kernel(DC_SHIFT_INVERSE_PROGRAM, DC_SHIFT_INVERSE_ENTRY, |inv| {
        let plane = inv.buffer(0)?;
        let shift = inv.int(3)?;
        let (min, max) = (inv.int(4)?, inv.int(5)?);
        let shifted: Vec<i32> = inv
            .read_i32(plane)?
            .iter()
            .map(|v| (v + (1 << shift)).clamp(min, max))
            .collect();
        inv.write_i32(plane, 0, &shifted)
    });
}

/// Gives every code-block a one byte codestream naming it and returns, per
/// tile, the plane the host kernels should scatter before the level shift.
fn tag_codeblocks(image: &mut J2kImage) -> Vec<Vec<i32>> {
    let mut expected = Vec::new();
    let mut tag = 0u8;
    for tile in &mut image.tiles {
        let width = tile.components[0].width as usize;
        let mut plane = vec![i32::MIN; width * tile.components[0].height as usize];
        let locations: Vec<_> = tile.codeblocks().map(|(location, _)| location).collect();
        for location in locations {
            let (sx, sy) = {
                let sb = tile.subband(&location).unwrap();
                (sb.bounds.x0 as usize, sb.bounds.y0 as usize)
            };
            let cb = tile.codeblock_mut(&location).unwrap();
            cb.compressed_data = vec![tag];
            cb.coding_passes = 1;
            let (cx, cy) = (sx + cb.bounds.x0 as usize, sy + cb.bounds.y0 as usize);
            for y in 0..cb.height as usize {
                for x in 0..cb.width as usize {
                    plane[(cy + y) * width + cx + x] = sample(tag, x, y);
                }
            }
            tag += 1;
        }
        expected.push(plane);
    }
    expected
}

#[test]
fn test_lossless_decode_places_every_codeblock() {
    init_logger();
    let mut image = build(
        ImageParameters {
            width: 40,
            height: 24,
            wavelet: WaveletKind::Reversible53,
            ..Default::default()
        },
        DecodeParameters {
            tile_size: Some((24, 24)),
            decomposition_levels: 1,
            codeblock_exp_w: 3,
            codeblock_exp_h: 3,
            ..Default::default()
        },
    );
    assert_eq!(image.tile_count(), 2);
    let expected = tag_codeblocks(&mut image);
    assert!(expected.iter().flatten().all(|&v| v != i32::MIN));

    let mut backend = HostBackend::new();
    register_entropy(&mut backend);
    register_lossless_dequantize(&mut backend);
    register_level_shift(&mut backend);
    let options = PipelineOptions {
        inverse_transform: false,
        ..Default::default()
    };
    let mut pipeline = DecodePipeline::new(backend, options).unwrap();
    pipeline.decode(&mut image).unwrap();

    for (t, plane) in expected.iter().enumerate() {
        let decoded = pipeline.read_plane_i32(&image, t, 0).unwrap();
        let shifted: Vec<i32> = plane.iter().map(|v| v + 128).collect();
        assert_eq!(decoded, shifted, "tile {t}");
    }
    assert!(image.tiles.iter().all(|t| t.coefficients.is_none()));
    assert!(image.tiles.iter().all(|t| t.stage == TileStage::Done));
    assert_eq!(pipeline.backend().live_buffers(), 2);
}

#[test]
fn test_irreversible_decode_scales_by_step_size() {
    init_logger();
    let mut image = build(
        ImageParameters {
            width: 16,
            height: 16,
            wavelet: WaveletKind::Irreversible97,
            ..Default::default()
        },
        DecodeParameters {
            decomposition_levels: 1,
            codeblock_exp_w: 3,
            codeblock_exp_h: 3,
            ..Default::default()
        },
    );
    let samples = tag_codeblocks(&mut image).remove(0);

    // Signalled steps differ per band; exponent 8 + gain keeps Mb at its default.
    let mut expected_scale = vec![0f64; 16 * 16];
    let bands = image.tiles[0].components[0]
        .resolutions
        .iter_mut()
        .flat_map(|r| r.subbands.iter_mut());
    for (i, sb) in bands.enumerate() {
        let gain = sb.orientation.gain_exponent() as i32;
        let mantissa = 256 * (i as u16 + 1);
        sb.set_quantization(8 + gain as u8, mantissa, 2).unwrap();
        assert_eq!(sb.magnitude_bits as i32, 9 + gain);

        // Mb bit-planes in, step * 2^(R + gain) out; both levels here are 1 of 1.
        let step = (1.0 + mantissa as f64 / 2048.0) * 2f64.powi(-(8 + gain));
        let scale = step * 2f64.powi(8 + gain);
        for y in sb.bounds.y0..sb.bounds.y1 {
            for x in sb.bounds.x0..sb.bounds.x1 {
                expected_scale[y as usize * 16 + x as usize] = scale;
            }
        }
    }

    let mut backend = HostBackend::new().with_alignment(4096);
    register_entropy(&mut backend);
    register_lossy_dequantize(&mut backend);
    let options = PipelineOptions {
        inverse_transform: false,
        color_transform: false,
        ..Default::default()
    };
    let mut pipeline = DecodePipeline::new(backend, options).unwrap();
    pipeline.decode(&mut image).unwrap();

    let decoded = pipeline.read_plane_f32(&image, 0, 0).unwrap();
    for (i, (&value, (&sample, &scale))) in decoded
        .iter()
        .zip(samples.iter().zip(&expected_scale))
        .enumerate()
    {
        let expected = sample as f64 * scale;
        assert!(
            (value as f64 - expected).abs() <= expected.abs() * 1e-6,
            "sample ({}, {}): {value} != {expected}",
            i % 16,
            i / 16
        );
    }
    let mut entry_points = vec![ENTROPY_ENTRY];
    entry_points.extend([DEQUANTIZE_LOSSY_ENTRY; 4]);
    assert_eq!(pipeline.backend().dispatched_entry_points(), entry_points);
    assert_eq!(image.tiles[0].stage, TileStage::Done);
}

#[test]
fn test_transform_levels_follow_tile_geometry() {
    init_logger();
    let mut image = build(
        ImageParameters {
            width: 70,
            height: 45,
            wavelet: WaveletKind::Reversible53,
            ..Default::default()
        },
        DecodeParameters {
            tile_size: Some((32, 32)),
            decomposition_levels: 2,
            ..Default::default()
        },
    );
    let expected: Vec<(i32, i32)> = image
        .tiles
        .iter()
        .flat_map(|t| &t.components)
        .flat_map(|c| c.resolutions.iter().skip(1))
        .map(|r| (r.width as i32, r.height as i32))
        .collect();
    assert_eq!(expected.len(), 6 * 2);

    let mut pipeline = DecodePipeline::new(HostBackend::new(), PipelineOptions::default()).unwrap();
    pipeline.decode(&mut image).unwrap();

    let launched: Vec<(i32, i32)> = pipeline
        .backend()
        .commands()
        .iter()
        .filter_map(|c| match c {
            Command::Dispatch {
                entry_point, args, ..
            } if entry_point == DWT_ENTRY => match (args[5], args[6]) {
                (KernelArg::Int(w), KernelArg::Int(h)) => Some((w, h)),
                _ => None,
            },
            _ => None,
        })
        .collect();
    assert_eq!(launched, expected);
    // One plane per tile survives, the replaced inputs are gone.
    assert_eq!(pipeline.backend().live_buffers(), 6);
}

#[test]
fn test_stage_failure_releases_image() {
    init_logger();
    let mut image = build(
        ImageParameters {
            width: 64,
            height: 32,
            ..Default::default()
        },
        DecodeParameters {
            tile_size: Some((32, 32)),
            decomposition_levels: 1,
            ..Default::default()
        },
    );
    let mut backend = HostBackend::new();
    backend.fail_kernel(DEQUANTIZE_LOSSY_ENTRY);
    let mut pipeline = DecodePipeline::new(backend, PipelineOptions::default()).unwrap();

    let err = pipeline.decode(&mut image).unwrap_err();
    match &err {
        J2kError::StageFailed { stage, tile, .. } => {
            assert_eq!(*stage, TileStage::Dequantized);
            assert_eq!(*tile, 0);
        }
        other => panic!("expected a stage failure, got {other:?}"),
    }
    assert!(err.to_string().starts_with("dequantize stage failed on tile 0"));
    assert_eq!(pipeline.backend().live_buffers(), 0);
    assert!(image.attached_buffers().is_empty());
    assert_eq!(image.tiles[0].stage, TileStage::EntropyDecoded);
    assert_eq!(image.tiles[1].stage, TileStage::Parsed);
}

#[test]
fn test_oversized_codestream_fails_entropy_stage() {
    init_logger();
    let mut image = build(
        ImageParameters {
            width: 16,
            height: 16,
            ..Default::default()
        },
        DecodeParameters {
            decomposition_levels: 0,
            codeblock_exp_w: 4,
            codeblock_exp_h: 4,
            max_codestream_size: Some(4),
            ..Default::default()
        },
    );
    image.tiles[0].components[0].resolutions[0].subbands[0].codeblocks[0].compressed_data =
        vec![0; 5];
    let mut pipeline = DecodePipeline::new(HostBackend::new(), PipelineOptions::default()).unwrap();

    let err = pipeline.decode(&mut image).unwrap_err();
    assert!(matches!(
        err,
        J2kError::StageFailed {
            stage: TileStage::EntropyDecoded,
            ..
        }
    ));
    assert!(matches!(
        err.root_cause(),
        J2kError::CodestreamTooLarge {
            length: 5,
            capacity: 4
        }
    ));
    assert_eq!(pipeline.backend().live_buffers(), 0);
}

#[test]
fn test_device_memory_exhaustion() {
    init_logger();
    let mut image = build(
        ImageParameters {
            width: 256,
            height: 256,
            ..Default::default()
        },
        DecodeParameters::default(),
    );
    // Room for the plane, not for the coefficient buffer.
    let backend = HostBackend::new().with_memory_limit(300_000);
    let mut pipeline = DecodePipeline::new(backend, PipelineOptions::default()).unwrap();

    let err = pipeline.decode(&mut image).unwrap_err();
    assert!(err.is_resource_allocation());
    assert!(matches!(
        err,
        J2kError::StageFailed {
            stage: TileStage::EntropyDecoded,
            ..
        }
    ));
    assert_eq!(pipeline.backend().live_buffers(), 0);
    assert_eq!(pipeline.backend().allocated_bytes(), 0);
}

#[test]
fn test_all_stages_disabled() {
    init_logger();
    let mut image = build(
        ImageParameters {
            width: 48,
            height: 48,
            component_count: 3,
            multi_component_transform: true,
            ..Default::default()
        },
        DecodeParameters::default(),
    );
    let options = PipelineOptions {
        entropy_decode: false,
        dequantize: false,
        inverse_transform: false,
        color_transform: false,
    };
    let mut pipeline = DecodePipeline::new(HostBackend::new(), options).unwrap();
    pipeline.decode(&mut image).unwrap();

    let backend = pipeline.backend();
    assert!(backend.dispatched_entry_points().is_empty());
    assert!(!backend.commands().iter().any(|c| matches!(c, Command::Compile { .. })));
    assert_eq!(backend.live_buffers(), 3);
    for c in 0..3 {
        let plane = pipeline.read_plane_f32(&image, 0, c).unwrap();
        assert_eq!(plane.len(), 48 * 48);
        assert!(plane.iter().all(|&v| v == 0.0));
    }
    assert_eq!(image.tiles[0].stage, TileStage::Done);
}

type CallLog = Rc<RefCell<Vec<(&'static str, u32, SampleRange)>>>;

struct RecordingColor(CallLog);

impl RecordingColor {
    fn record(&self, call: &'static str, tile: &J2kTile, range: SampleRange) -> Result<(), J2kError> {
        self.0.borrow_mut().push((call, tile.index, range));
        Ok(())
    }
}

impl ColorTransform for RecordingColor {
    fn decode_lossless(
        &mut self,
        _backend: &mut dyn ComputeBackend,
        tile: &J2kTile,
        range: SampleRange,
    ) -> Result<(), J2kError> {
        self.record("lossless", tile, range)
    }

    fn decode_lossy(
        &mut self,
        _backend: &mut dyn ComputeBackend,
        tile: &J2kTile,
        range: SampleRange,
    ) -> Result<(), J2kError> {
        self.record("lossy", tile, range)
    }

    fn inverse_level_shift(
        &mut self,
        _backend: &mut dyn ComputeBackend,
        tile: &J2kTile,
        range: SampleRange,
    ) -> Result<(), J2kError> {
        self.record("level shift", tile, range)
    }
}

fn color_calls(image: ImageParameters, options: PipelineOptions) -> Vec<(&'static str, u32, SampleRange)> {
    let mut image = build(
        image,
        DecodeParameters {
            tile_size: Some((16, 32)),
            decomposition_levels: 1,
            ..Default::default()
        },
    );
    let log = CallLog::default();
    let color = Box::new(RecordingColor(Rc::clone(&log)));
    let mut pipeline = DecodePipeline::with_color_transform(HostBackend::new(), options, color).unwrap();
    pipeline.decode(&mut image).unwrap();
    log.take()
}

#[test]
fn test_color_stage_selection() {
    init_logger();
    let rgb = ImageParameters {
        width: 32,
        height: 32,
        component_count: 3,
        multi_component_transform: true,
        ..Default::default()
    };
    let range = SampleRange::new(8, false);
    assert_eq!(
        color_calls(rgb, PipelineOptions::default()),
        vec![("lossy", 0, range), ("lossy", 1, range)]
    );

    let reversible = ImageParameters {
        wavelet: WaveletKind::Reversible53,
        range_bits: 10,
        ..rgb
    };
    let range = SampleRange::new(10, false);
    assert_eq!(
        color_calls(reversible, PipelineOptions::default()),
        vec![("lossless", 0, range), ("lossless", 1, range)]
    );

    // The component transform needs exactly three components.
    let two = ImageParameters {
        component_count: 2,
        ..rgb
    };
    let calls = color_calls(two, PipelineOptions::default());
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|(call, _, _)| *call == "level shift"));

    let signed = ImageParameters {
        signed: true,
        multi_component_transform: false,
        ..rgb
    };
    assert!(color_calls(signed, PipelineOptions::default()).is_empty());

    let disabled = PipelineOptions {
        color_transform: false,
        ..Default::default()
    };
    assert!(color_calls(rgb, disabled).is_empty());
}

#[test]
fn test_packet_contributions_reach_entropy_records() {
    init_logger();
    let mut image = build(
        ImageParameters {
            width: 16,
            height: 16,
            wavelet: WaveletKind::Reversible53,
            ..Default::default()
        },
        DecodeParameters {
            decomposition_levels: 0,
            codeblock_exp_w: 4,
            codeblock_exp_h: 4,
            ..Default::default()
        },
    );

    // One block: included in layer 0, two zero bit-planes, one pass, two bytes.
    let packet = [0xC8, 0x80, 0xAB, 0xCD];
    let tile = &mut image.tiles[0];
    let mut state = PrecinctState::new(0, 0, &tile.components[0].resolutions[0]);
    assert_eq!(decode_packet(&packet, &mut state, 0, tile).unwrap(), 4);

    let seen: Rc<RefCell<Vec<(CodeBlockRecord, Vec<u8>)>>> = Rc::default();
    let mut backend = HostBackend::new();
    let sink = Rc::clone(&seen);
    backend.register_kernel(ENTROPY_PROGRAM, ENTROPY_ENTRY, move |inv| {
        let slot = inv.int(2)? as usize;
        let records: Vec<CodeBlockRecord> = bytemuck::pod_collect_to_vec(inv.bytes(inv.buffer(3)?)?);
        let codestreams = inv.bytes(inv.buffer(1)?)?;
        for (i, record) in records.into_iter().enumerate() {
            sink.borrow_mut()
                .push((record, codestreams[i * slot..(i + 1) * slot].to_vec()));
        }
        Ok(())
    });
    let options = PipelineOptions {
        dequantize: false,
        inverse_transform: false,
        color_transform: false,
        ..Default::default()
    };
    let mut pipeline = DecodePipeline::new(backend, options).unwrap();
    pipeline.decode(&mut image).unwrap();

    let seen = seen.take();
    assert_eq!(seen.len(), 1);
    let (record, slot) = &seen[0];
    assert_eq!(record.length, 2);
    assert_eq!(record.magnitude_bits, 9);
    assert_eq!(record.significant_bits, 7);
    assert_eq!(record.coding_passes, 1);
    assert_eq!((record.width, record.height), (16, 16));
    assert_eq!(record.stripe_count, 4);
    assert_eq!(slot.len(), 16 * 16 * 2);
    assert_eq!(&slot[..2], &[0xAB, 0xCD]);
    assert!(slot[2..].iter().all(|&b| b == 0));

    // Coefficients that skip dequantization are still released.
    assert!(image.tiles[0].coefficients.is_none());
    assert_eq!(pipeline.backend().live_buffers(), 1);
}
