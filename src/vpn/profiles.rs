//! Profile store: the directory of `.ovpn` files Vyper can launch

use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// File extension recognized as a VPN profile
pub const PROFILE_EXTENSION: &str = "ovpn";

#[derive(Error, Debug)]
pub enum ProfileImportError {
    #[error("Profile already exists: {0}")]
    Duplicate(String),
    #[error("Not an .ovpn profile: {}", .0.display())]
    InvalidExtension(PathBuf),
    #[error("Failed to import profile: {0}")]
    Io(#[from] io::Error),
}

/// A stored profile file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    name: String,
    path: PathBuf,
}

impl Profile {
    /// File name, used as the profile identifier
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn has_profile_extension(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(PROFILE_EXTENSION))
}

pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    /// Open the store at `dir`, creating the directory if needed
    pub fn open(dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All profiles in the store, sorted by name
    pub fn list(&self) -> io::Result<Vec<Profile>> {
        let mut profiles = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type()?.is_file() || !has_profile_extension(&path) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            profiles.push(Profile { name, path });
        }
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        debug!("Found {} profiles in {}", profiles.len(), self.dir.display());
        Ok(profiles)
    }

    /// Look up a profile by file name
    pub fn find(&self, name: &str) -> io::Result<Option<Profile>> {
        Ok(self.list()?.into_iter().find(|p| p.name == name))
    }

    /// Copy `source` into the store
    ///
    /// Existing profiles are never overwritten.
    pub fn import_file(&self, source: &Path) -> Result<Profile, ProfileImportError> {
        if !has_profile_extension(source) {
            return Err(ProfileImportError::InvalidExtension(source.to_path_buf()));
        }
        let file_name = source
            .file_name()
            .ok_or_else(|| ProfileImportError::InvalidExtension(source.to_path_buf()))?;
        let name = file_name.to_string_lossy().into_owned();
        let destination = self.dir.join(file_name);

        // create_new makes the duplicate check and the create a single step
        let mut target = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&destination)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(ProfileImportError::Duplicate(name));
            }
            Err(e) => return Err(e.into()),
        };

        let copied = fs::File::open(source).and_then(|mut src| io::copy(&mut src, &mut target));
        if let Err(e) = copied {
            drop(target);
            let _ = fs::remove_file(&destination);
            return Err(e.into());
        }

        info!("Imported profile {} from {}", name, source.display());
        Ok(Profile {
            name,
            path: destination,
        })
    }
}
