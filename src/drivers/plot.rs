use std::io::Cursor;
use std::ops::Range;
use std::path::Path;

use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use plotters::prelude::*;

use crate::error::PlotError;
use crate::results::{Axes, FigureDescriptor};

#[derive(Clone, Debug)]
pub struct PlotStyle {
    pub width: u32,
    pub height: u32,
    pub background: RGBColor,
    pub foreground: RGBColor,
    pub palette: Vec<RGBColor>,
    /// Titles, tick labels and legends. Text needs a system font.
    pub labels: bool,
}

impl Default for PlotStyle {
    fn default() -> Self {
        Self {
            width: 900,
            height: 400,
            background: WHITE,
            foreground: BLACK,
            palette: vec![BLUE, RED, GREEN, CYAN, MAGENTA, RGBColor(255, 140, 0)],
            labels: true,
        }
    }
}

/// Renders every axes of `figure` stacked vertically into one PNG.
pub fn render_figure_png(figure: &FigureDescriptor, style: &PlotStyle) -> Result<Vec<u8>, PlotError> {
    let has_points = figure
        .axes
        .iter()
        .flat_map(|a| &a.series)
        .any(|s| !s.x.is_empty());
    if !has_points {
        return Err(PlotError::Empty(figure.title.clone()));
    }
    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let root = if figure.title.is_empty() || !style.labels {
            root
        } else {
            root.titled(
                &figure.title,
                ("sans-serif", 22).into_font().color(&style.foreground),
            )?
        };
        let panels = root.split_evenly((figure.axes.len(), 1));
        for (axes, panel) in figure.axes.iter().zip(panels.iter()) {
            draw_axes(axes, panel, style)?;
        }
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}

/// "Save figure": renders and writes the PNG to `path`.
pub fn save_figure_png(
    figure: &FigureDescriptor,
    style: &PlotStyle,
    path: &Path,
) -> Result<(), PlotError> {
    let png = render_figure_png(figure, style)?;
    std::fs::write(path, png).map_err(|source| PlotError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    log::info!("saved figure `{}` to {}", figure.title, path.display());
    Ok(())
}

fn draw_axes<DB: DrawingBackend>(
    axes: &Axes,
    area: &DrawingArea<DB, plotters::coord::Shift>,
    style: &PlotStyle,
) -> Result<(), PlotError>
where
    DB::ErrorType: 'static,
{
    let xs = axes.series.iter().flat_map(|s| s.x.iter().copied());
    let ys = axes.series.iter().flat_map(|s| s.y.iter().copied());
    let (x_range, y_range) = (bounds(xs), bounds(ys));

    let mut builder = ChartBuilder::on(area);
    builder.margin(10);
    if style.labels {
        builder
            .caption(
                &axes.title,
                ("sans-serif", 18).into_font().color(&style.foreground),
            )
            .set_label_area_size(LabelAreaPosition::Left, 50)
            .set_label_area_size(LabelAreaPosition::Bottom, 40);
    }
    let mut chart = builder.build_cartesian_2d(x_range, y_range)?;
    if style.labels {
        chart
            .configure_mesh()
            .x_desc(axes.x_label.as_str())
            .y_desc(axes.y_label.as_str())
            .light_line_style(&style.foreground.mix(0.1))
            .draw()?;
    }

    for (idx, series) in axes.series.iter().enumerate() {
        let color = if style.palette.is_empty() {
            style.foreground
        } else {
            style.palette[idx % style.palette.len()]
        };
        let points = series.x.iter().copied().zip(series.y.iter().copied());
        let label = if series.label.is_empty() {
            format!("series {idx}")
        } else {
            series.label.clone()
        };
        chart
            .draw_series(LineSeries::new(points, &color))?
            .label(label)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
    }
    if style.labels && axes.series.len() > 1 {
        chart
            .configure_series_labels()
            .border_style(&style.foreground.mix(0.2))
            .background_style(&style.background)
            .draw()?;
    }
    Ok(())
}

fn bounds(values: impl Iterator<Item = f64>) -> Range<f64> {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    if !lo.is_finite() {
        return 0.0..1.0;
    }
    if (hi - lo).abs() < f64::EPSILON {
        return (lo - 1.0)..(hi + 1.0);
    }
    lo..hi
}

fn encode_png(buffer: &[u8], width: u32, height: u32) -> Result<Vec<u8>, PlotError> {
    let image = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, buffer.to_vec())
        .ok_or_else(|| PlotError::Render("failed to allocate image buffer".into()))?;
    let mut output = Vec::new();
    DynamicImage::ImageRgb8(image).write_to(&mut Cursor::new(&mut output), ImageFormat::Png)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::Series;
    use image::GenericImageView;

    #[test]
    fn empty_figure_is_rejected() {
        let figure = FigureDescriptor {
            title: "nothing".into(),
            axes: vec![Axes {
                title: String::new(),
                x_label: String::new(),
                y_label: String::new(),
                series: vec![Series {
                    label: "a".into(),
                    x: vec![],
                    y: vec![],
                }],
            }],
        };
        assert!(matches!(
            render_figure_png(&figure, &PlotStyle::default()),
            Err(PlotError::Empty(title)) if title == "nothing"
        ));
    }

    fn one_series(points: usize) -> FigureDescriptor {
        FigureDescriptor {
            title: "alpha".into(),
            axes: vec![Axes {
                title: "TP9".into(),
                x_label: "s".into(),
                y_label: "uV".into(),
                series: vec![Series {
                    label: "TP9".into(),
                    x: (0..points).map(|i| i as f64 * 0.5).collect(),
                    y: (0..points).map(|i| (i as f64).sin()).collect(),
                }],
            }],
        }
    }

    fn unlabelled() -> PlotStyle {
        PlotStyle {
            width: 320,
            height: 200,
            labels: false,
            ..PlotStyle::default()
        }
    }

    #[test]
    fn figure_with_points_renders_png() {
        let png = render_figure_png(&one_series(40), &unlabelled()).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!(decoded.dimensions(), (320, 200));
    }

    #[test]
    fn save_figure_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alpha.png");
        save_figure_png(&one_series(5), &unlabelled(), &path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"\x89PNG"));
    }

    #[test]
    fn empty_palette_falls_back_to_foreground() {
        let style = PlotStyle {
            palette: Vec::new(),
            ..unlabelled()
        };
        assert!(render_figure_png(&one_series(3), &style).is_ok());
    }

    #[test]
    fn bounds_pad_flat_and_empty_ranges() {
        assert_eq!(bounds([2.0, 2.0].into_iter()), 1.0..3.0);
        assert_eq!(bounds(std::iter::empty()), 0.0..1.0);
        assert_eq!(bounds([f64::NAN, -1.0, 4.0].into_iter()), -1.0..4.0);
    }
}
