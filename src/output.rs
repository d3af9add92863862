use std::fs;
use std::path::Path;

use csv::{Writer, WriterBuilder};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use serde::Serialize;

use crate::analysis::DropAnalysis;
use crate::errors::{PendantDropError, Result};
use crate::image_io::save_image;
use crate::image_utils::Region;
use crate::pipeline::{AnalysisSession, TimelineRow};

const DROP_DIR_PREFIX: &str = "drop";

const PROFILE_COLOR: Rgb<u8> = Rgb([0, 128, 255]);
const FIT_COLOR: Rgb<u8> = Rgb([255, 0, 128]);
const NEEDLE_REGION_COLOR: Rgb<u8> = Rgb([13, 26, 255]);
const DROP_REGION_COLOR: Rgb<u8> = Rgb([255, 26, 13]);

const PARAMS_HEADER: &str = "\
# All physical quantities are in SI units.
# Regions are [left, top, right, bottom], the needle width is in pixels and
# the image angle in degrees (positive is counter-clockwise).
";

const TIMELINE_HEADER: [&str; 11] = [
    "Time (s)",
    "IFT (N/m)",
    "Volume (m3)",
    "Surface area (m2)",
    "Apex radius (m)",
    "Worthington",
    "Bond number",
    "Image angle (degrees)",
    "Apex x-coordinate (px)",
    "Apex y-coordinate (px)",
    "Needle width (px)",
];

#[derive(Serialize)]
struct DropParams {
    #[serde(rename = "Physical")]
    physical: PhysicalSection,
    #[serde(rename = "Image")]
    image: ImageSection,
}

#[derive(Serialize)]
struct PhysicalSection {
    timestamp: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    interfacial_tension: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    volume: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    surface_area: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    apex_radius: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    worthington: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bond_number: Option<f64>,
}

#[derive(Serialize)]
struct ImageSection {
    drop_region: [i64; 4],
    needle_region: [i64; 4],
    #[serde(skip_serializing_if = "Option::is_none")]
    apex_coordinates: Option<[f64; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    needle_width: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_angle: Option<f64>,
}

impl DropParams {
    fn from_analysis(analysis: &DropAnalysis) -> Self {
        let row = TimelineRow::from_analysis(analysis);
        Self {
            physical: PhysicalSection {
                timestamp: row.timestamp,
                interfacial_tension: row.interfacial_tension,
                volume: row.volume,
                surface_area: row.surface_area,
                apex_radius: row.apex_radius,
                worthington: row.worthington,
                bond_number: row.bond_number,
            },
            image: ImageSection {
                drop_region: analysis.drop_region().as_ltrb(),
                needle_region: analysis.needle_region().as_ltrb(),
                apex_coordinates: row.apex_x.zip(row.apex_y).map(|(x, y)| [x, y]),
                needle_width: row.needle_width,
                image_angle: row.image_angle,
            },
        }
    }
}

/// Name of the directory of the `index`-th drop (0-based) out of `count`:
/// 1-based and zero padded to the width of `count`
pub fn drop_dir_name(index: usize, count: usize) -> String {
    let padding = count.to_string().len();
    format!("{}{:0>width$}", DROP_DIR_PREFIX, index + 1, width = padding)
}

/// Save every finished analysis of the session under `output_dir`, plus a
/// timeline when there is more than one drop.
pub fn save_session<P: AsRef<Path>>(session: &AnalysisSession, output_dir: P) -> Result<()> {
    if session.in_flight() > 0 {
        log::warn!("{} drops are still running and will not be saved", session.in_flight());
    }
    let drops: Vec<&DropAnalysis> = session.analyses().map(|(_, analysis)| analysis).collect();
    save_drops(&drops, output_dir)
}

pub fn save_drops<P: AsRef<Path>>(drops: &[&DropAnalysis], output_dir: P) -> Result<()> {
    let output_dir = output_dir.as_ref();
    fs::create_dir_all(output_dir)?;

    for (i, drop) in drops.iter().enumerate() {
        let drop_dir = output_dir.join(drop_dir_name(i, drops.len()));
        save_drop(drop, &drop_dir)?;
    }

    if drops.len() > 1 {
        let mut rows: Vec<TimelineRow> = drops.iter().map(|d| TimelineRow::from_analysis(d)).collect();
        rows.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        write_timeline_csv(&rows, output_dir.join("timeline.csv"))?;
    }

    log::info!("Saved {} drops to {}", drops.len(), output_dir.display());
    Ok(())
}

/// Write the record, profiles and images of one drop into `drop_dir`
pub fn save_drop<P: AsRef<Path>>(analysis: &DropAnalysis, drop_dir: P) -> Result<()> {
    let drop_dir = drop_dir.as_ref();
    fs::create_dir_all(drop_dir)?;

    // A copy already exists wherever the image came from
    if !analysis.is_image_replicated() {
        save_image(analysis.image(), drop_dir.join("image_original.png"))?;
    }
    annotate(analysis).save(drop_dir.join("image_annotated.png"))?;

    write_params(analysis, drop_dir.join("params.toml"))?;

    if let Some(profile) = analysis.profile() {
        write_points_csv(&profile.points, drop_dir.join("profile_extracted.csv"))?;
    }
    if let Some(curve) = analysis.fitted_curve() {
        write_points_csv(curve, drop_dir.join("profile_fit.csv"))?;
    }
    if let Some(residuals) = analysis.residuals() {
        write_residuals_csv(&residuals.points, drop_dir.join("profile_fit_residuals.csv"))?;
    }

    Ok(())
}

fn write_params<P: AsRef<Path>>(analysis: &DropAnalysis, path: P) -> Result<()> {
    let params = DropParams::from_analysis(analysis);
    let body = toml::to_string(&params)
        .map_err(|e| PendantDropError::Config(format!("Failed to serialize drop parameters: {}", e)))?;
    fs::write(path, format!("{}\n{}", PARAMS_HEADER, body))?;
    Ok(())
}

fn headerless_writer<P: AsRef<Path>>(path: P) -> Result<Writer<fs::File>> {
    Ok(WriterBuilder::new().has_headers(false).from_path(path)?)
}

/// `x,y` per line with one decimal
pub fn write_points_csv<P: AsRef<Path>>(points: &[(f64, f64)], path: P) -> Result<()> {
    let mut writer = headerless_writer(path)?;
    for &(x, y) in points {
        writer.write_record(&[format!("{:.1}", x), format!("{:.1}", y)])?;
    }
    writer.flush()?;
    Ok(())
}

/// `arclength parameter,residual` per line
pub fn write_residuals_csv<P: AsRef<Path>>(residuals: &[(f64, f64)], path: P) -> Result<()> {
    let mut writer = headerless_writer(path)?;
    for &(s, e) in residuals {
        writer.write_record(&[s.to_string(), e.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

fn format_value(value: Option<f64>) -> String {
    value.map_or_else(|| "nan".to_string(), |v| v.to_string())
}

pub fn write_timeline_csv<P: AsRef<Path>>(rows: &[TimelineRow], path: P) -> Result<()> {
    let mut writer = Writer::from_path(path)?;
    writer.write_record(TIMELINE_HEADER)?;

    for row in rows {
        writer.write_record(&[
            row.timestamp.to_string(),
            format_value(row.interfacial_tension),
            format_value(row.volume),
            format_value(row.surface_area),
            format_value(row.apex_radius),
            format_value(row.worthington),
            format_value(row.bond_number),
            format_value(row.image_angle),
            format_value(row.apex_x),
            format_value(row.apex_y),
            format_value(row.needle_width),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

fn draw_polyline(canvas: &mut RgbImage, points: &[(f64, f64)], color: Rgb<u8>) {
    for pair in points.windows(2) {
        draw_line_segment_mut(
            canvas,
            (pair[0].0 as f32, pair[0].1 as f32),
            (pair[1].0 as f32, pair[1].1 as f32),
            color,
        );
    }
}

/// Outline of the part of `region` that lies on the canvas
fn draw_region(canvas: &mut RgbImage, region: &Region, color: Rgb<u8>) {
    if let Some(visible) = region.clip_to(canvas.width(), canvas.height()) {
        draw_hollow_rect_mut(canvas, Rect::at(visible.x, visible.y).of_size(visible.width, visible.height), color);
    }
}

/// Copy of the drop image with regions, extracted edges and fitted curve
/// drawn on top
pub fn annotate(analysis: &DropAnalysis) -> RgbImage {
    let mut canvas = analysis.image().to_rgb8();

    if let Some(edges) = analysis.needle_edges() {
        draw_polyline(&mut canvas, &edges.left, PROFILE_COLOR);
        draw_polyline(&mut canvas, &edges.right, PROFILE_COLOR);
    }
    if let Some(profile) = analysis.profile() {
        draw_polyline(&mut canvas, &profile.points, PROFILE_COLOR);
    }
    if let Some(curve) = analysis.fitted_curve() {
        draw_polyline(&mut canvas, curve, FIT_COLOR);
    }

    draw_region(&mut canvas, &analysis.needle_region(), NEEDLE_REGION_COLOR);
    draw_region(&mut canvas, &analysis.drop_region(), DROP_REGION_COLOR);

    canvas
}
