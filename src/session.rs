use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::Context;
use image::RgbImage;

use crate::{
    choropleth::{
        category::Category,
        dataset::Dataset,
        export::export_classified_features,
        render::{plan_map, render_map_to_file, MapPlan, RenderSettings},
        thresholds::ThresholdSet,
    },
    error::MapError,
    geofile::archive::read_dataset_from_zip_bytes,
};

const UPLOAD_DIR_NAME: &str = "upload";
const MAP_IMAGE_NAME: &str = "map.jpg";
const EXPORT_NAME: &str = "classified.geojson";

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(0);

/// A user interaction, applied to a session with `Session::apply`.
#[derive(Debug, Clone)]
pub enum Event {
    /// A zipped shapefile bundle was uploaded. Replaces the dataset and resets every metric to 0.
    UploadArchive { name: String, bytes: Vec<u8> },
    SelectLabelColumn(String),
    SetMetric { index: usize, value: f64 },
    /// Metrics keyed by the value of the selected label column.
    SetMetricsByLabel(HashMap<String, f64>),
    SetThreshold { category: Category, value: f64 },
    SetThresholds(ThresholdSet),
    SetTitle(Option<String>),
}

/// Result of a render: the plan that was drawn, the image and where it was saved.
pub struct RenderedMap {
    pub plan: MapPlan,
    pub image: RgbImage,
    pub path: PathBuf,
}

/// State of one interactive session.
///
/// Every session owns a private workspace directory, so concurrent sessions never share an
/// upload or a rendered image.
#[derive(Debug, Clone)]
pub struct Session {
    workspace: PathBuf,
    dataset: Option<Dataset>,
    label_column: Option<String>,
    thresholds: ThresholdSet,
    title: Option<String>,
}

impl Session {
    /// Create a session with a fresh workspace below `data_dir`.
    pub fn new(data_dir: &Path) -> anyhow::Result<Self> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        Self::open(&data_dir.join(format!("session-{}-{}", std::process::id(), id)))
    }

    /// Create a session working in `workspace`, which is kept between runs. A previous upload and
    /// image in it are replaced by the next upload and render.
    pub fn open(workspace: &Path) -> anyhow::Result<Self> {
        let workspace = workspace.to_path_buf();
        fs::create_dir_all(&workspace)
            .with_context(|| format!("Creating session workspace {:?}", workspace))?;
        log::debug!("Using session workspace {:?}", workspace);
        Ok(Self {
            workspace,
            dataset: None,
            label_column: None,
            thresholds: ThresholdSet::default(),
            title: None,
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn dataset(&self) -> Option<&Dataset> {
        self.dataset.as_ref()
    }

    pub fn label_column(&self) -> Option<&str> {
        self.label_column.as_deref()
    }

    pub fn thresholds(&self) -> &ThresholdSet {
        &self.thresholds
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn image_path(&self) -> PathBuf {
        self.workspace.join(MAP_IMAGE_NAME)
    }

    pub fn export_path(&self) -> PathBuf {
        self.workspace.join(EXPORT_NAME)
    }

    fn require_dataset(&self) -> Result<&Dataset, MapError> {
        self.dataset.as_ref().ok_or(MapError::NoDataset)
    }

    fn require_label_column(&self) -> Result<&str, MapError> {
        self.require_dataset()?;
        self.label_column.as_deref().ok_or(MapError::NoLabelColumn)
    }

    /// Apply one event and return the updated session. On error `self` is left as it was.
    pub fn apply(&self, event: Event) -> anyhow::Result<Session> {
        let mut next = self.clone();
        match event {
            Event::UploadArchive { name, bytes } => {
                let upload_dir = self.workspace.join(UPLOAD_DIR_NAME);
                let dataset = read_dataset_from_zip_bytes(&name, &bytes, &upload_dir)?;
                next.label_column = dataset.columns().first().cloned();
                next.dataset = Some(dataset);
            }
            Event::SelectLabelColumn(column) => {
                self.require_dataset()?.ensure_column(&column)?;
                next.label_column = Some(column);
            }
            Event::SetMetric { index, value } => {
                let dataset = next.dataset.as_mut().ok_or(MapError::NoDataset)?;
                dataset.set_metric(index, value)?;
            }
            Event::SetMetricsByLabel(metrics) => {
                let column = self.require_label_column()?.to_string();
                let dataset = next.dataset.as_mut().ok_or(MapError::NoDataset)?;
                let updated = dataset.set_metrics_by_label(&column, &metrics)?;
                log::info!("Updated metrics of {} features", updated);
            }
            Event::SetThreshold { category, value } => {
                next.thresholds = self.thresholds.with(category, value)?;
            }
            Event::SetThresholds(thresholds) => {
                next.thresholds = thresholds;
            }
            Event::SetTitle(title) => {
                next.title = title;
            }
        }
        Ok(next)
    }

    /// Apply events in order, stopping at the first failure.
    pub fn apply_all(&self, events: impl IntoIterator<Item = Event>) -> anyhow::Result<Session> {
        events
            .into_iter()
            .try_fold(self.clone(), |session, event| session.apply(event))
    }

    /// Classify and lay out the current dataset without drawing it.
    pub fn plan(&self) -> anyhow::Result<MapPlan> {
        let dataset = self.require_dataset()?;
        let label_column = self.require_label_column()?;
        plan_map(dataset, label_column, &self.thresholds, self.title.as_deref())
    }

    /// Render the current dataset to this session's image path, overwriting the previous render.
    pub fn render(&self, settings: &RenderSettings) -> anyhow::Result<RenderedMap> {
        let plan = self.plan()?;
        let path = self.image_path();
        let image = render_map_to_file(&plan, settings, &path)?;
        Ok(RenderedMap { plan, image, path })
    }

    /// Write the classified regions as GeoJSON into the workspace.
    pub fn export(&self) -> anyhow::Result<PathBuf> {
        let plan = self.plan()?;
        let path = self.export_path();
        export_classified_features(&plan, &path)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use testdir::testdir;

    use crate::{
        choropleth::{
            category::Category, render::RenderSettings, thresholds::ThresholdSet,
        },
        error::{ErrorKind, MapError},
        narrate::narration::{NarrationConfig, Narrator},
        choropleth::dataset::Dataset,
        geofile::feature::FeatureMap,
        test_utils::{regions_shapefile_zip, square, zip_entries},
    };

    use super::{Event, Session};

    fn uploaded_session(data_dir: &std::path::Path) -> Session {
        let bytes = regions_shapefile_zip(&data_dir.join("fixture"), "regions");
        Session::new(data_dir)
            .unwrap()
            .apply(Event::UploadArchive {
                name: "regions.zip".to_string(),
                bytes,
            })
            .unwrap()
    }

    fn map_error(err: &anyhow::Error) -> &MapError {
        err.downcast_ref::<MapError>().unwrap()
    }

    #[test]
    fn test_sessions_have_isolated_workspaces() {
        let data_dir = testdir!();
        let first = Session::new(&data_dir).unwrap();
        let second = Session::new(&data_dir).unwrap();
        assert_ne!(first.image_path(), second.image_path());
        assert!(first.workspace().is_dir());
        assert!(second.workspace().is_dir());
    }

    #[test]
    fn test_upload_defaults_label_column_and_metrics() {
        let session = uploaded_session(&testdir!());
        assert_eq!(Some("CODE"), session.label_column());
        let dataset = session.dataset().unwrap();
        assert_eq!(3, dataset.len());
        assert!(dataset.regions().iter().all(|region| region.metric == 0.0));
    }

    #[rstest::rstest]
    #[case(3.0, Category::Green)]
    #[case(5.0, Category::Yellow)]
    #[case(75.0, Category::Gray)]
    fn test_end_to_end_classification(#[case] metric: f64, #[case] expected: Category) {
        let session = uploaded_session(&testdir!())
            .apply_all([
                Event::SetThresholds(ThresholdSet::new(5.0, 19.0, 39.0, 59.0).unwrap()),
                Event::SelectLabelColumn("NAME".to_string()),
                Event::SetMetric {
                    index: 0,
                    value: metric,
                },
            ])
            .unwrap();
        let plan = session.plan().unwrap();
        assert_eq!("North", plan.regions[0].label);
        assert_eq!(expected, plan.regions[0].category);
    }

    #[test]
    fn test_metrics_by_label_use_selected_column() {
        let session = uploaded_session(&testdir!())
            .apply_all([
                Event::SelectLabelColumn("NAME".to_string()),
                Event::SetMetricsByLabel(HashMap::from([
                    ("South".to_string(), 25.0),
                    ("East".to_string(), 60.0),
                ])),
            ])
            .unwrap();
        let categories: Vec<Category> = session
            .plan()
            .unwrap()
            .regions
            .iter()
            .map(|region| region.category)
            .collect();
        assert_eq!(
            vec![Category::Green, Category::Orange, Category::Gray],
            categories
        );
    }

    #[test]
    fn test_failed_event_leaves_session_unchanged() {
        let session = uploaded_session(&testdir!());

        let err = session
            .apply(Event::SetThreshold {
                category: Category::Yellow,
                value: 1.0,
            })
            .unwrap_err();
        assert!(matches!(map_error(&err), MapError::InvalidThresholds(_)));
        assert_eq!(&ThresholdSet::default(), session.thresholds());

        let err = session
            .apply(Event::SelectLabelColumn("POPULATION".to_string()))
            .unwrap_err();
        assert_eq!(ErrorKind::Input, map_error(&err).kind());
        assert_eq!(Some("CODE"), session.label_column());
    }

    #[test]
    fn test_upload_without_shapefile_produces_no_dataset() {
        let session = Session::new(&testdir!()).unwrap();
        let err = session
            .apply(Event::UploadArchive {
                name: "notes.zip".to_string(),
                bytes: zip_entries(&[("notes.txt", b"hello".as_slice())]),
            })
            .unwrap_err();
        assert!(matches!(
            map_error(&err),
            MapError::NoShapefileInArchive { .. }
        ));
        assert!(session.dataset().is_none());
    }

    #[test]
    fn test_events_before_upload_fail() {
        let session = Session::new(&testdir!()).unwrap();
        let err = session
            .apply(Event::SetMetric {
                index: 0,
                value: 1.0,
            })
            .unwrap_err();
        assert!(matches!(map_error(&err), MapError::NoDataset));
        assert!(matches!(
            map_error(&session.plan().unwrap_err()),
            MapError::NoDataset
        ));
    }

    #[test]
    fn test_repeated_plans_agree() {
        let session = uploaded_session(&testdir!())
            .apply(Event::SetTitle(Some("Vaccination coverage".to_string())))
            .unwrap();
        assert_eq!(session.plan().unwrap(), session.plan().unwrap());
    }

    #[test]
    fn test_export_writes_into_workspace() {
        let session = uploaded_session(&testdir!());
        let path = session.export().unwrap();
        assert!(path.starts_with(session.workspace()));
        assert!(path.exists());
    }

    #[test]
    fn test_dataset_without_columns_has_no_label_column() {
        let dataset = Dataset::new(
            vec![(FeatureMap::new(), square(77.0, 10.0))],
            Some("EPSG:4326".to_string()),
            vec![],
        )
        .unwrap();
        let session = Session {
            dataset: Some(dataset),
            ..Session::new(&testdir!()).unwrap()
        };

        assert!(matches!(
            map_error(&session.plan().unwrap_err()),
            MapError::NoLabelColumn
        ));
        let err = session
            .apply(Event::SetMetricsByLabel(HashMap::from([(
                "North".to_string(),
                1.0,
            )])))
            .unwrap_err();
        assert!(matches!(map_error(&err), MapError::NoLabelColumn));
    }

    #[test]
    fn test_reopened_workspace_replaces_previous_render_inputs() {
        let data_dir = testdir!();
        let workspace = data_dir.join("coverage");
        let bytes = regions_shapefile_zip(&data_dir.join("fixture"), "regions");
        let upload = || Event::UploadArchive {
            name: "regions.zip".to_string(),
            bytes: bytes.clone(),
        };

        let first = Session::open(&workspace).unwrap().apply(upload()).unwrap();
        let first_export = first.export().unwrap();
        let second = Session::open(&workspace).unwrap().apply(upload()).unwrap();

        assert_eq!(first.workspace(), second.workspace());
        assert_eq!(first_export, second.export().unwrap());
        let entries = std::fs::read_dir(&workspace).unwrap().count();
        assert_eq!(2, entries);
    }

    #[test]
    fn test_render_succeeds_without_credential() {
        let session = uploaded_session(&testdir!())
            .apply(Event::SetMetric {
                index: 1,
                value: 42.0,
            })
            .unwrap();
        let narrator = Narrator::new(None, NarrationConfig::default());

        let rendered = session.render(&RenderSettings::default()).unwrap();
        assert!(rendered.path.exists());
        assert_eq!(session.image_path(), rendered.path);
        assert_eq!(Category::Red, rendered.plan.regions[1].category);

        let err = narrator.narrate(&rendered.path).unwrap_err();
        assert_eq!(ErrorKind::Configuration, map_error(&err).kind());
    }
}
