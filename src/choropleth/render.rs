use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    ops::Range,
    path::Path,
};

use anyhow::Context;
use geo::{Area, BoundingRect};
use image::{codecs::jpeg::JpegEncoder, RgbImage};
use plotters::{
    coord::Shift,
    prelude::*,
    style::{
        register_font,
        text_anchor::{HPos, Pos, VPos},
        FontDesc, FontStyle,
    },
};
use serde::Deserialize;

use crate::{crs::reprojection::normalize_for_display, error::MapError};

use super::{category::Category, dataset::Dataset, thresholds::ThresholdSet};

const FONT_FAMILY: &str = "sans-serif";
static REGULAR_FONT: &[u8] = include_bytes!("../../assets/fonts/DejaVuSans.ttf");
static BOLD_FONT: &[u8] = include_bytes!("../../assets/fonts/DejaVuSans-Bold.ttf");
const LEGEND_TITLE: &str = "Percentage";
/// Fraction of the data extent added around it on every side.
const EXTENT_PADDING: f64 = 0.05;
/// Keeps very long and thin regions from producing an image too narrow for the legend.
const MAX_ASPECT_RATIO: f64 = 3.0;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    /// Size of the long edge of the map area in pixels.
    pub long_edge_px: u32,
    pub jpeg_quality: u8,
    pub label_font_px: Option<u32>,
    pub title_font_px: Option<u32>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            long_edge_px: 2048,
            jpeg_quality: 90,
            label_font_px: None,
            title_font_px: None,
        }
    }
}

impl RenderSettings {
    pub fn label_font_px(&self) -> u32 {
        self.label_font_px
            .unwrap_or_else(|| (self.long_edge_px / 110).max(8))
    }

    pub fn title_font_px(&self) -> u32 {
        self.title_font_px
            .unwrap_or_else(|| (self.long_edge_px / 45).max(12))
    }

    fn legend_font_px(&self) -> u32 {
        self.label_font_px() * 6 / 5
    }

    fn margin_px(&self) -> u32 {
        (self.long_edge_px / 100).max(4)
    }
}

/// A classified region in display coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct MapRegion {
    pub geometry: geo::MultiPolygon,
    pub category: Category,
    pub label: String,
    pub metric: f64,
    pub anchor: Option<(f64, f64)>,
}

impl MapRegion {
    /// The two caption lines drawn at the anchor point.
    pub fn caption(&self) -> [String; 2] {
        [self.label.clone(), format!("{}%", self.metric)]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LegendEntry {
    pub category: Category,
    pub label: String,
}

/// Everything needed to draw a map, computed without touching the raster backend.
#[derive(Debug, Clone, PartialEq)]
pub struct MapPlan {
    pub regions: Vec<MapRegion>,
    pub legend: Vec<LegendEntry>,
    pub title: Option<String>,
    /// Bounds of all regions in display coordinates.
    pub extent: geo::Rect,
}

/// Classify, reproject and caption every region of the dataset.
pub fn plan_map(
    dataset: &Dataset,
    label_column: &str,
    thresholds: &ThresholdSet,
    title: Option<&str>,
) -> anyhow::Result<MapPlan> {
    if dataset.is_empty() {
        return Err(MapError::EmptyDataset.into());
    }
    dataset.ensure_column(label_column)?;

    let display_regions = normalize_for_display(dataset)?;
    let regions: Vec<MapRegion> = dataset
        .regions()
        .iter()
        .zip(display_regions)
        .map(|(region, display)| MapRegion {
            geometry: display.geometry,
            category: thresholds.classify(region.metric),
            label: region.label(label_column).to_string(),
            metric: region.metric,
            anchor: display.anchor.map(|point| (point.x(), point.y())),
        })
        .collect();

    let extent = regions
        .iter()
        .filter_map(|region| region.geometry.bounding_rect())
        .reduce(|acc, rect| {
            geo::Rect::new(
                geo::coord! { x: acc.min().x.min(rect.min().x), y: acc.min().y.min(rect.min().y) },
                geo::coord! { x: acc.max().x.max(rect.max().x), y: acc.max().y.max(rect.max().y) },
            )
        })
        .ok_or(MapError::EmptyDataset)?;

    let legend = thresholds
        .legend_entries()
        .into_iter()
        .map(|(category, label)| LegendEntry { category, label })
        .collect();

    Ok(MapPlan {
        regions,
        legend,
        title: title
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .map(str::to_string),
        extent,
    })
}

/// Grow the extent by a margin, give degenerate extents a nonzero size and limit the aspect ratio.
fn padded_extent(extent: &geo::Rect) -> geo::Rect {
    let center = extent.center();
    let mut width = extent.width().max(1.0) * (1.0 + 2.0 * EXTENT_PADDING);
    let mut height = extent.height().max(1.0) * (1.0 + 2.0 * EXTENT_PADDING);
    width = width.max(height / MAX_ASPECT_RATIO);
    height = height.max(width / MAX_ASPECT_RATIO);
    geo::Rect::new(
        geo::coord! { x: center.x - width / 2.0, y: center.y - height / 2.0 },
        geo::coord! { x: center.x + width / 2.0, y: center.y + height / 2.0 },
    )
}

/// Make the bundled fonts available to plotters under `FONT_FAMILY`, so text renders the same on
/// every host.
fn register_fonts() -> Result<(), MapError> {
    for (style, bytes) in [(FontStyle::Normal, REGULAR_FONT), (FontStyle::Bold, BOLD_FONT)] {
        register_font(FONT_FAMILY, style, bytes).map_err(|err| {
            MapError::Render(format!("could not load bundled font, {:?}", err))
        })?;
    }
    Ok(())
}

fn regular_font(size_px: u32) -> FontDesc<'static> {
    (FONT_FAMILY, size_px as f64).into_font()
}

fn bold_font(size_px: u32) -> FontDesc<'static> {
    regular_font(size_px).style(FontStyle::Bold)
}

fn text_size(font: &FontDesc, text: &str) -> Result<(u32, u32), MapError> {
    font.box_size(text)
        .map_err(|err| MapError::Render(format!("could not measure text {:?}, {:?}", text, err)))
}

/// Height of the band `DrawingArea::titled` takes off the top for `title`.
fn title_band_px(title: &str, settings: &RenderSettings) -> Result<u32, MapError> {
    let (_, text_height) = text_size(&bold_font(settings.title_font_px()), title)?;
    Ok(text_height + 2 * (text_height / 2).min(5))
}

struct CanvasLayout {
    width: u32,
    height: u32,
}

impl CanvasLayout {
    /// The map area keeps the extent's aspect ratio with its long edge at `long_edge_px`;
    /// margins and the title band are added around it.
    fn new(
        extent: &geo::Rect,
        title: Option<&str>,
        settings: &RenderSettings,
    ) -> Result<Self, MapError> {
        let long_edge = settings.long_edge_px as f64;
        let (map_width, map_height) = if extent.width() >= extent.height() {
            (long_edge, long_edge * extent.height() / extent.width())
        } else {
            (long_edge * extent.width() / extent.height(), long_edge)
        };
        let margin = 2 * settings.margin_px();
        let title_band = match title {
            Some(title) => title_band_px(title, settings)?,
            None => 0,
        };
        Ok(Self {
            width: map_width.round() as u32 + margin,
            height: map_height.round() as u32 + margin + title_band,
        })
    }
}

/// Pixel bounds of the plotting area, the part of the image the extent is mapped onto.
#[derive(Debug, Clone, PartialEq)]
struct MapArea {
    x_pixels: Range<i32>,
    y_pixels: Range<i32>,
}

fn category_color(category: Category) -> RGBColor {
    let (r, g, b) = category.rgb();
    RGBColor(r, g, b)
}

fn ring_points(ring: &geo::LineString) -> Vec<(f64, f64)> {
    ring.coords().map(|coord| (coord.x, coord.y)).collect()
}

/// Area inside the exterior rings, holes included.
fn outer_area(geometry: &geo::MultiPolygon) -> f64 {
    geometry
        .0
        .iter()
        .map(|polygon| geo::Polygon::new(polygon.exterior().clone(), vec![]).unsigned_area())
        .sum()
}

/// Regions in painting order. Holes are painted white, so a region must be painted before
/// anything lying inside its holes; ordering by outer area guarantees that.
fn fill_order(regions: &[MapRegion]) -> Vec<&MapRegion> {
    let mut ordered: Vec<&MapRegion> = regions.iter().collect();
    ordered.sort_by(|a, b| outer_area(&b.geometry).total_cmp(&outer_area(&a.geometry)));
    ordered
}

type PixelRect = [(i32, i32); 2];

/// Pixel placement of the legend: a framed box in the lower right corner of the map area with a
/// bold title above one black-edged swatch per category.
struct LegendLayout {
    frame: PixelRect,
    title_position: (i32, i32),
    /// Swatch corners and label position of each entry.
    rows: Vec<(PixelRect, (i32, i32))>,
}

fn legend_layout(
    legend: &[LegendEntry],
    settings: &RenderSettings,
    map_area: &MapArea,
) -> Result<LegendLayout, MapError> {
    let font_px = settings.legend_font_px();
    let (title_width, title_height) = text_size(&bold_font(font_px), LEGEND_TITLE)?;
    let entry_font = regular_font(font_px);
    let mut label_width = 0;
    for entry in legend {
        label_width = label_width.max(text_size(&entry_font, &entry.label)?.0);
    }

    let padding = font_px as i32 / 2;
    let swatch = font_px as i32;
    let row_height = swatch + padding;
    let width = padding * 2 + (title_width as i32).max(swatch + padding + label_width as i32);
    let height = padding * 3 + title_height as i32 + row_height * legend.len() as i32;
    let right = map_area.x_pixels.end - padding;
    let bottom = map_area.y_pixels.end - padding;
    let (left, top) = (right - width, bottom - height);

    let rows_top = top + padding * 2 + title_height as i32;
    let rows = (0..legend.len() as i32)
        .map(|index| {
            let y = rows_top + index * row_height;
            (
                [(left + padding, y), (left + padding + swatch, y + swatch)],
                (left + padding * 2 + swatch, y),
            )
        })
        .collect();
    Ok(LegendLayout {
        frame: [(left, top), (right, bottom)],
        title_position: (left + padding, top + padding),
        rows,
    })
}

fn draw_legend(
    root: &DrawingArea<BitMapBackend, Shift>,
    legend: &[LegendEntry],
    settings: &RenderSettings,
    layout: &LegendLayout,
) -> Result<(), Box<dyn std::error::Error>> {
    let font_px = settings.legend_font_px();
    root.draw(&Rectangle::new(layout.frame, WHITE.filled()))?;
    root.draw(&Rectangle::new(layout.frame, BLACK.stroke_width(1)))?;
    root.draw(&Text::new(
        LEGEND_TITLE,
        layout.title_position,
        bold_font(font_px),
    ))?;
    for (entry, (swatch, label_position)) in legend.iter().zip(&layout.rows) {
        root.draw(&Rectangle::new(
            *swatch,
            category_color(entry.category).filled(),
        ))?;
        root.draw(&Rectangle::new(*swatch, BLACK.stroke_width(1)))?;
        root.draw(&Text::new(
            entry.label.as_str(),
            *label_position,
            regular_font(font_px),
        ))?;
    }
    Ok(())
}

fn draw_map(
    plan: &MapPlan,
    settings: &RenderSettings,
    extent: &geo::Rect,
    layout: &CanvasLayout,
    buffer: &mut [u8],
) -> Result<MapArea, Box<dyn std::error::Error>> {
    let root = BitMapBackend::with_buffer(buffer, (layout.width, layout.height)).into_drawing_area();
    root.fill(&WHITE)?;
    let map_root = match &plan.title {
        Some(title) => root.titled(title, bold_font(settings.title_font_px()))?,
        None => root.clone(),
    };

    // No mesh is configured, so the chart has no axes or tick marks.
    let mut chart = ChartBuilder::on(&map_root)
        .margin(settings.margin_px())
        .build_cartesian_2d(
            extent.min().x..extent.max().x,
            extent.min().y..extent.max().y,
        )?;

    for region in fill_order(&plan.regions) {
        let fill = category_color(region.category);
        chart.draw_series(
            region
                .geometry
                .0
                .iter()
                .map(|polygon| Polygon::new(ring_points(polygon.exterior()), fill.filled())),
        )?;
        chart.draw_series(
            region
                .geometry
                .0
                .iter()
                .flat_map(|polygon| polygon.interiors().iter())
                .map(|ring| Polygon::new(ring_points(ring), WHITE.filled())),
        )?;
    }

    let outline_width = (settings.long_edge_px / 1024).max(1);
    for region in &plan.regions {
        chart.draw_series(
            region
                .geometry
                .0
                .iter()
                .flat_map(|polygon| {
                    std::iter::once(polygon.exterior()).chain(polygon.interiors().iter())
                })
                .map(|ring| PathElement::new(ring_points(ring), BLACK.stroke_width(outline_width))),
        )?;
    }

    let label_font_px = settings.label_font_px();
    let text_style =
        TextStyle::from(regular_font(label_font_px)).pos(Pos::new(HPos::Center, VPos::Center));
    let line_offset = (label_font_px as i32 + 1) / 2 + 1;
    chart.draw_series(
        plan.regions
            .iter()
            .filter_map(|region| region.anchor.map(|anchor| (anchor, region.caption())))
            .map(|(anchor, [label, metric])| {
                EmptyElement::at(anchor)
                    + Text::new(label, (0, -line_offset), text_style.clone())
                    + Text::new(metric, (0, line_offset), text_style.clone())
            }),
    )?;

    let (x_pixels, y_pixels) = chart.plotting_area().get_pixel_range();
    let map_area = MapArea { x_pixels, y_pixels };
    let legend = legend_layout(&plan.legend, settings, &map_area)?;
    draw_legend(&root, &plan.legend, settings, &legend)?;

    root.present()?;
    Ok(map_area)
}

fn rasterize_with_area(
    plan: &MapPlan,
    settings: &RenderSettings,
) -> anyhow::Result<(RgbImage, MapArea)> {
    register_fonts()?;
    let extent = padded_extent(&plan.extent);
    let layout = CanvasLayout::new(&extent, plan.title.as_deref(), settings)?;
    let mut buffer = vec![0u8; layout.width as usize * layout.height as usize * 3];
    let map_area = draw_map(plan, settings, &extent, &layout, &mut buffer)
        .map_err(|err| MapError::Render(err.to_string()))?;
    let image = RgbImage::from_raw(layout.width, layout.height, buffer).ok_or_else(|| {
        MapError::Render("pixel buffer does not match the canvas size".to_string())
    })?;
    Ok((image, map_area))
}

/// Draw the plan into an in-memory RGB image.
pub fn rasterize(plan: &MapPlan, settings: &RenderSettings) -> anyhow::Result<RgbImage> {
    Ok(rasterize_with_area(plan, settings)?.0)
}

/// Encode the image as JPEG at `path`. The file is written next to the target and renamed into
/// place, so `path` never holds a partial image.
pub fn save_jpeg(image: &RgbImage, path: &Path, quality: u8) -> anyhow::Result<()> {
    let partial_path = path.with_extension("jpg.partial");
    {
        let file = File::create(&partial_path)
            .with_context(|| format!("Creating image file {:?}", partial_path))?;
        let mut writer = BufWriter::new(file);
        let mut encoder = JpegEncoder::new_with_quality(&mut writer, quality.clamp(1, 100));
        encoder
            .encode_image(image)
            .map_err(|err| MapError::Render(format!("could not encode JPEG, {}", err)))?;
        writer.flush()?;
    }
    fs::rename(&partial_path, path)
        .with_context(|| format!("Moving rendered image to {:?}", path))?;
    Ok(())
}

/// Rasterize the plan, persist it as JPEG at `path` and return the in-memory image.
pub fn render_map_to_file(
    plan: &MapPlan,
    settings: &RenderSettings,
    path: &Path,
) -> anyhow::Result<RgbImage> {
    let image = rasterize(plan, settings)?;
    save_jpeg(&image, path, settings.jpeg_quality)?;
    log::info!(
        "Rendered {} regions to {:?} ({}x{})",
        plan.regions.len(),
        path,
        image.width(),
        image.height()
    );
    Ok(image)
}
