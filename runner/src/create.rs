use crate::{
    config::{
        write_yaml, ConfigErrors, JobConfig, JobDir, JobSettings, MergeConfig, TaskKind,
        TaskRecord, RESULT_DIR, RUN_DIR, TILES_DIR,
    },
    tiles::TileGrid,
};
use globset::{GlobBuilder, GlobMatcher};
use ignore::{DirEntry, WalkBuilder};
use image::ImageFormat;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

/// input files considered images, matched case-insensitively
pub const IMAGE_GLOB: &str = "*.{png,tif,tiff,jpg,jpeg,gif,bmp}";

#[derive(Debug, Clone, PartialEq)]
pub struct ImageDescriptor {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub format: Option<ImageFormat>,
}

impl ImageDescriptor {
    /// Probe the dimensions without decoding the whole image
    pub fn probe(path: &Path) -> Result<Self, image::ImageError> {
        let (width, height) = image::image_dimensions(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            width,
            height,
            format: ImageFormat::from_path(path).ok(),
        })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn image_matcher() -> Result<GlobMatcher, ConfigErrors> {
    Ok(GlobBuilder::new(IMAGE_GLOB)
        .case_insensitive(true)
        .build()?
        .compile_matcher())
}

/// Images directly inside `dir` sorted by name, files that can't be opened are skipped
pub fn scan_images(dir: &Path) -> Result<Vec<ImageDescriptor>, ConfigErrors> {
    if !dir.is_dir() {
        return Err(ConfigErrors::InvalidDirectory(dir.to_path_buf()));
    }

    let matcher = image_matcher()?;
    debug!("Filtering with glob: {matcher:?}");

    Ok(WalkBuilder::new(dir)
        .max_depth(Some(1))
        .standard_filters(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
        .filter(|entry| matcher.is_match(entry.file_name()))
        .map(DirEntry::into_path)
        .filter_map(|path| match ImageDescriptor::probe(&path) {
            Ok(image) => Some(image),
            Err(error) => {
                warn!("Skipping {}, unable to open: {error}", path.display());
                None
            }
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedJob {
    pub images: usize,
    pub tasks: usize,
    pub merge_tasks: usize,
}

/// Tile every image below `settings.images` and write the segmentation and merge
/// configurations into a fresh job directory
pub fn create_job(settings: JobSettings, job_dir: &JobDir) -> Result<CreatedJob, ConfigErrors> {
    let config_path = job_dir.config_path(TaskKind::Segmentation);
    if config_path.exists() {
        return Err(ConfigErrors::JobExists(job_dir.path().to_path_buf()));
    }

    let grid = TileGrid::new(
        settings.tile_size,
        settings.overlap_size,
        settings.tiles_per_task,
    )?;
    settings.validate()?;

    let images = scan_images(&settings.images)?;
    if images.is_empty() {
        warn!("No images found in {}", settings.images.display());
    }

    for dir in [
        job_dir.stdout_dir(TaskKind::Segmentation),
        job_dir.stdout_dir(TaskKind::Merge),
        job_dir.tmp_dir(),
        job_dir.tiles_dir(),
        job_dir.result_dir(),
    ] {
        fs::create_dir_all(&dir)?;
    }

    let mut tasks = Vec::new();
    let mut merge_tasks = Vec::with_capacity(images.len());

    for image in &images {
        let name = image.file_name();
        // relative to the job dir so the job can be moved as a whole
        let tile_dir = Path::new(RUN_DIR).join(TILES_DIR).join(&name);
        fs::create_dir_all(job_dir.path().join(&tile_dir))?;

        for (index, args) in grid.tile_args(image.width, image.height).into_iter().enumerate() {
            tasks.push(TaskRecord {
                id: (tasks.len() + 1).to_string(),
                input: Some(image.path.clone()),
                args: Some(args),
                output: Some(tile_dir.join(format!("{:03}.{name}", index + 1))),
            });
        }

        merge_tasks.push(TaskRecord {
            id: (merge_tasks.len() + 1).to_string(),
            input: Some(tile_dir),
            args: None,
            output: Some(Path::new(RUN_DIR).join(RESULT_DIR).join(&name)),
        });

        debug!(
            "{} is {}x{} ({:?})",
            image.path.display(),
            image.width,
            image.height,
            image.format
        );
    }

    let created = CreatedJob {
        images: images.len(),
        tasks: tasks.len(),
        merge_tasks: merge_tasks.len(),
    };

    write_yaml(
        &job_dir.config_path(TaskKind::Merge),
        &MergeConfig { tasks: merge_tasks },
    )?;
    write_yaml(&config_path, &JobConfig { settings, tasks })?;

    info!(
        "Created job with {} tasks and {} merge tasks for {} images in {}",
        created.tasks,
        created.merge_tasks,
        created.images,
        job_dir.path().display()
    );

    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{catalog::TaskCatalog, config::Size};
    use image::GrayImage;

    fn settings(images: &Path) -> JobSettings {
        JobSettings {
            images: images.to_path_buf(),
            model: PathBuf::from("/data/model"),
            binary: PathBuf::from("/opt/chm"),
            tile_size: Size::new(520, 520),
            overlap_size: Size::default(),
            tiles_per_task: 3,
            tasks_per_node: 2,
            disable_histeq: true,
            merge_binary: None,
        }
    }

    fn images(dir: &Path) -> PathBuf {
        let images = dir.join("images");
        fs::create_dir_all(images.join("nested")).unwrap();
        GrayImage::new(800, 800).save(images.join("b.png")).unwrap();
        GrayImage::new(100, 50).save(images.join("a.PNG")).unwrap();
        GrayImage::new(10, 10).save(images.join("nested").join("c.png")).unwrap();
        fs::write(images.join("notes.txt"), "not an image").unwrap();
        fs::write(images.join("broken.png"), "not a png either").unwrap();
        images
    }

    #[test]
    fn scan_skips_non_images() {
        let dir = tempfile::tempdir().unwrap();
        let found = scan_images(&images(dir.path())).unwrap();

        assert_eq!(
            found.iter().map(ImageDescriptor::file_name).collect::<Vec<_>>(),
            ["a.PNG", "b.png"]
        );
        assert_eq!((found[1].width, found[1].height), (800, 800));
        assert_eq!(found[1].format, Some(ImageFormat::Png));
    }

    #[test]
    fn scan_requires_directory() {
        let dir = tempfile::tempdir().unwrap();

        assert!(matches!(
            scan_images(&dir.path().join("missing")),
            Err(ConfigErrors::InvalidDirectory(_))
        ));
    }

    #[test]
    fn creates_tasks_per_image() {
        let dir = tempfile::tempdir().unwrap();
        let job_dir = JobDir::new(dir.path().join("job"));

        let created = create_job(settings(&images(dir.path())), &job_dir).unwrap();

        // a.PNG is a single tile, b.png has 2x2 tiles split 3 + 1
        assert_eq!(
            created,
            CreatedJob {
                images: 2,
                tasks: 3,
                merge_tasks: 2
            }
        );

        let config = job_dir.load_job_config().unwrap();
        assert_eq!(config.tasks[0].args.as_deref(), Some("-t 1,1"));
        assert_eq!(
            config.tasks[0].output.as_deref(),
            Some(Path::new("run/tiles/a.PNG/001.a.PNG"))
        );
        assert_eq!(config.tasks[1].args.as_deref(), Some("-t 1,1 -t 1,2 -t 2,1"));
        assert_eq!(config.tasks[2].id, "3");
        assert_eq!(
            config.tasks[2].output.as_deref(),
            Some(Path::new("run/tiles/b.png/002.b.png"))
        );

        let merge = job_dir.load_merge_config().unwrap();
        assert_eq!(merge.tasks[1].input.as_deref(), Some(Path::new("run/tiles/b.png")));
        assert_eq!(
            merge.tasks[1].output.as_deref(),
            Some(Path::new("run/result/b.png"))
        );

        assert!(job_dir.stdout_dir(TaskKind::Merge).is_dir());
        assert!(job_dir.tmp_dir().is_dir());
        assert!(job_dir.path().join("run/tiles/b.png").is_dir());

        let catalog = TaskCatalog::new(&config.tasks, Some(job_dir.path()));
        assert_eq!(catalog.incomplete_ids().unwrap(), ["1", "2", "3"]);
    }

    #[test]
    fn refuses_existing_job() {
        let dir = tempfile::tempdir().unwrap();
        let job_dir = JobDir::new(dir.path().join("job"));
        let images = images(dir.path());

        create_job(settings(&images), &job_dir).unwrap();

        assert!(matches!(
            create_job(settings(&images), &job_dir),
            Err(ConfigErrors::JobExists(_))
        ));
    }

    #[test]
    fn rejects_overlap_before_scanning() {
        let dir = tempfile::tempdir().unwrap();
        let job_dir = JobDir::new(dir.path().join("job"));
        let mut settings = settings(&dir.path().join("missing"));
        settings.overlap_size = Size::new(260, 0);

        assert!(matches!(
            create_job(settings, &job_dir),
            Err(ConfigErrors::Tiles(_))
        ));
        assert!(!job_dir.path().exists());
    }
}
