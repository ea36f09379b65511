//! Per-device render model slots and the find-or-load policy that fills them.

use crate::config::LoaderConfig;
use crate::model::resource::{RenderModelError, RenderModelResource};
use crate::renderer::device::GraphicsDevice;
use crate::tracking::{TrackingProvider, HMD_INDEX, MAX_TRACKED_DEVICES};
use rmdl::RawRenderModel;
use std::io;
use std::path::Path;

/// Device index to optional render model. Each slot owns its resource.
#[derive(Debug)]
pub struct RenderModelSlots {
    slots: Vec<Option<RenderModelResource>>,
}

impl Default for RenderModelSlots {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderModelSlots {
    pub fn new() -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(MAX_TRACKED_DEVICES).collect(),
        }
    }

    pub fn get(&self, device_index: usize) -> Option<&RenderModelResource> {
        self.slots.get(device_index).and_then(Option::as_ref)
    }

    /// Puts `resource` in the slot, releasing whatever was there first.
    /// An out-of-range index releases `resource` instead.
    pub fn assign<D: GraphicsDevice + ?Sized>(
        &mut self,
        gpu: &mut D,
        device_index: usize,
        mut resource: RenderModelResource,
    ) {
        let Some(slot) = self.slots.get_mut(device_index) else {
            log::warn!(
                "device index {device_index} out of range; discarding render model {}",
                resource.name()
            );
            resource.release(gpu);
            return;
        };
        if let Some(mut previous) = slot.take() {
            previous.release(gpu);
        }
        *slot = Some(resource);
    }

    /// Occupied slots in ascending device index order.
    pub fn occupied(&self) -> impl Iterator<Item = (usize, &RenderModelResource)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|r| (i, r)))
    }

    pub fn release_all<D: GraphicsDevice + ?Sized>(&mut self, gpu: &mut D) {
        for slot in &mut self.slots {
            if let Some(mut resource) = slot.take() {
                resource.release(gpu);
            }
        }
    }

    /// Releases every slot, then loads a model for each non-HMD device the
    /// tracking runtime names one for. Returns the number of loaded models.
    pub fn setup_render_models<D: GraphicsDevice + ?Sized>(
        &mut self,
        gpu: &mut D,
        tracking: &dyn TrackingProvider,
        loader: &LoaderConfig,
    ) -> usize {
        self.release_all(gpu);

        let mut loaded = 0;
        for device_index in HMD_INDEX + 1..MAX_TRACKED_DEVICES {
            let Some(name) = tracking.render_model_name(device_index) else {
                continue;
            };
            match find_or_load(gpu, &name, tracking, loader) {
                Ok(resource) => {
                    self.assign(gpu, device_index, resource);
                    loaded += 1;
                }
                Err(e) => {
                    log::error!("unable to load render model for tracked device {device_index} ({name}): {e}");
                }
            }
        }
        log::info!("render models ready for {loaded} devices");
        loaded
    }
}

/// Loads `<model_dir>/<name>.model` when it exists. Otherwise uses the
/// runtime's own model, saving it to that path for next time.
pub fn find_or_load<D: GraphicsDevice + ?Sized>(
    gpu: &mut D,
    name: &str,
    tracking: &dyn TrackingProvider,
    loader: &LoaderConfig,
) -> Result<RenderModelResource, RenderModelError> {
    let path = loader.model_path(name);
    if path.is_file() {
        return RenderModelResource::load_from_file(gpu, name, &path, loader);
    }

    let Some(raw) = tracking.device_model(name) else {
        return Err(RenderModelError::Io {
            source: rmdl::Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no model file and the tracking runtime has no model of that name",
            )),
            path,
        });
    };
    persist(&path, &raw);
    RenderModelResource::load_from_device_model(gpu, name, &raw, loader)
}

fn persist(path: &Path, raw: &RawRenderModel) {
    let result = path
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .map_err(rmdl::Error::from)
        .and_then(|_| rmdl::write_file(path, raw));
    match result {
        Ok(()) => log::info!("saved device render model to {}", path.display()),
        Err(e) => log::warn!("could not save render model to {}: {e}", path.display()),
    }
}
