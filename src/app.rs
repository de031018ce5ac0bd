//! Wires a resolved configuration into the full service stack. The hosting
//! layer (and the binary) go through here instead of assembling services by
//! hand.

use crate::config::{AppConfig, ObjectStoreSettings};
use crate::download::DownloadService;
use crate::metadata::{
    ArchiveExtractor, AudioExtractor, ExtractorRegistry, ImageExtractor, MetadataPipeline,
};
use crate::object_store::{FsObjectStore, HttpObjectStore, ObjectStore};
use crate::store::FileStore;
use crate::sweep::ReconciliationSweep;
use crate::upload::UploadService;
use anyhow::Result;
use std::sync::Arc;

pub struct App {
    pub store: Arc<dyn FileStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub uploads: UploadService,
    pub downloads: DownloadService,
    pub pipeline: Arc<MetadataPipeline>,
    pub sweep: ReconciliationSweep,
}

impl App {
    /// Builds the service stack: object store per config, all three
    /// extractors registered, pipeline workers spawned. Must run inside a
    /// tokio runtime.
    pub fn build(config: &AppConfig, store: Arc<dyn FileStore>) -> Result<Self> {
        let objects: Arc<dyn ObjectStore> = match &config.object_store {
            ObjectStoreSettings::Http {
                url,
                bucket,
                timeout_sec,
            } => Arc::new(HttpObjectStore::new(
                url.clone(),
                bucket.clone(),
                *timeout_sec,
            )?),
            ObjectStoreSettings::Fs { dir } => Arc::new(FsObjectStore::new(dir.clone())),
        };

        let registry = ExtractorRegistry::new()
            .register(Arc::new(AudioExtractor::new(
                store.clone(),
                objects.clone(),
                config.pipeline.audio.clone(),
            )))
            .register(Arc::new(ArchiveExtractor::new(store.clone())))
            .register(Arc::new(ImageExtractor::new(
                store.clone(),
                objects.clone(),
                config.pipeline.transcode_timeout,
            )));
        let worker_count = config
            .pipeline
            .worker_count
            .unwrap_or_else(MetadataPipeline::default_worker_count);
        let pipeline = Arc::new(MetadataPipeline::start(
            Arc::new(registry),
            config.pipeline.queue_capacity,
            worker_count,
        ));

        let uploads = UploadService::new(
            store.clone(),
            pipeline.clone(),
            config.uploads_dir.clone(),
        );
        let downloads = DownloadService::new(
            store.clone(),
            config.uploads_dir.clone(),
            config.download.clone(),
        );
        let sweep = ReconciliationSweep::new(store.clone(), config.uploads_dir.clone());

        Ok(Self {
            store,
            objects,
            uploads,
            downloads,
            pipeline,
            sweep,
        })
    }
}
