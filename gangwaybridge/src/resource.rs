//! The `resource1`/`resource2` channel payloads: streaming package files.
//!
//! With no `package`/`path` options the channel answers with the package
//! listing in its close options and finishes immediately. Otherwise the
//! requested file is resolved, content-negotiated via `accept`, template-
//! expanded and streamed one chunk per loop turn so other channels get a
//! fair share of the transport.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, warn};

use gangwaywire::error::Problem;

use crate::channel::{Channel, ChannelCore, ChannelEvent};
use crate::packages::{Listing, PackageDirs};

pub struct ResourceChannel {
    /// Close-options field carrying the listing: the old payload name used
    /// `resources`, the newer one `packages`. Nothing else differs.
    listing_field: &'static str,
    dirs: PackageDirs,
    queue: VecDeque<Bytes>,
}

impl ResourceChannel {
    /// The `resource1` payload.
    pub fn v1() -> Box<dyn Channel> {
        Box::new(Self::with_dirs("resources", PackageDirs::from_env()))
    }

    /// The `resource2` payload.
    pub fn v2() -> Box<dyn Channel> {
        Box::new(Self::with_dirs("packages", PackageDirs::from_env()))
    }

    pub fn with_dirs(listing_field: &'static str, dirs: PackageDirs) -> Self {
        Self {
            listing_field,
            dirs,
            queue: VecDeque::new(),
        }
    }
}

/// Open outcome classification per errno.
enum OpenError {
    /// Worth trying the next content-negotiation variant.
    Retry,
    Fatal(Problem),
}

fn read_file(path: &std::path::Path) -> Result<Vec<u8>, OpenError> {
    match std::fs::read(path) {
        Ok(contents) => Ok(contents),
        Err(err) => {
            let classified = match err.raw_os_error() {
                Some(libc::ENOENT)
                | Some(libc::EISDIR)
                | Some(libc::ENAMETOOLONG)
                | Some(libc::ELOOP)
                | Some(libc::EINVAL) => {
                    debug!("resource file was not found: {}", path.display());
                    OpenError::Retry
                }
                Some(libc::EACCES) | Some(libc::EPERM) => {
                    warn!("{}: {}", path.display(), err);
                    OpenError::Fatal(Problem::NotAuthorized)
                }
                _ => {
                    warn!("{}: {}", path.display(), err);
                    OpenError::Fatal(Problem::InternalError)
                }
            };
            Err(classified)
        }
    }
}

/// Interpose `accept` before the extension: `dir/base.ext` with accept
/// `min` becomes `dir/base.min.ext`. None when the name has no extension.
fn accept_path(path: &str, accept: &str) -> Option<String> {
    let dot = path.rfind('.')?;
    if let Some(slash) = path.rfind('/') {
        if dot < slash {
            return None;
        }
    }
    Some(format!("{}.{}{}", &path[..dot], accept, &path[dot..]))
}

impl Channel for ResourceChannel {
    fn prepare(&mut self, core: &mut ChannelCore) {
        let options = core.options().clone();

        let package = match options.str_field("package") {
            Ok(package) => package,
            Err(_) => {
                core.fail(
                    Problem::ProtocolError,
                    "invalid \"package\" option in resource channel",
                );
                return;
            }
        };
        let path = match options.str_field("path") {
            Ok(path) => path,
            Err(_) => {
                core.fail(
                    Problem::ProtocolError,
                    "invalid \"path\" option in resource channel",
                );
                return;
            }
        };
        let accept = match options.strv_field("accept") {
            Ok(accept) => accept.unwrap_or_default(),
            Err(_) => {
                core.fail(
                    Problem::ProtocolError,
                    "invalid \"accept\" option in resource channel",
                );
                return;
            }
        };

        // The no-argument form answers with the listing and is done.
        let (package, path) = match (package, path) {
            (None, None) => {
                let listing = Listing::load(&self.dirs);
                core.close_options_mut()
                    .insert(self.listing_field.to_string(), listing.to_json());
                core.ready();
                core.close(None);
                return;
            }
            (Some(package), Some(path)) => (package.to_string(), path.to_string()),
            (Some(_), None) => {
                core.fail(
                    Problem::ProtocolError,
                    "no \"path\" option specified for resource channel",
                );
                return;
            }
            (None, Some(_)) => {
                core.fail(
                    Problem::ProtocolError,
                    "no \"package\" option specified for resource channel",
                );
                return;
            }
        };

        // A host qualifier rides along on the package name; it feeds back
        // into template expansion.
        let (package, host) = match package.find('@') {
            Some(at) => (
                package[..at].to_string(),
                Some(package[at + 1..].to_string()),
            ),
            None => (package, None),
        };

        let listing = Listing::load(&self.dirs);
        let Some(filename) = listing.resolve(&package, &path) else {
            core.close(Some(Problem::NotFound));
            return;
        };
        let filename = filename.to_string_lossy().into_owned();

        // Content negotiation: probe each accept variant, fall back to the
        // plain file. Only "try the next one" errors keep the loop going.
        let mut opened: Option<Vec<u8>> = None;
        let mut accepted: Option<String> = None;
        let mut fatal: Option<Problem> = None;
        for variant in &accept {
            let Some(alternate) = accept_path(&filename, variant) else {
                continue;
            };
            match read_file(std::path::Path::new(&alternate)) {
                Ok(contents) => {
                    opened = Some(contents);
                    accepted = Some(variant.clone());
                    break;
                }
                Err(OpenError::Retry) => continue,
                Err(OpenError::Fatal(problem)) => {
                    fatal = Some(problem);
                    break;
                }
            }
        }
        if let Some(problem) = fatal {
            core.close(Some(problem));
            return;
        }
        let contents = match opened {
            Some(contents) => contents,
            None => match read_file(std::path::Path::new(&filename)) {
                Ok(contents) => contents,
                Err(OpenError::Retry) => {
                    core.close(Some(Problem::NotFound));
                    return;
                }
                Err(OpenError::Fatal(problem)) => {
                    core.close(Some(problem));
                    return;
                }
            },
        };

        // The first frame is meta information about the negotiation.
        if let Some(accepted) = &accepted {
            let meta = serde_json::json!({ "accept": accepted });
            self.queue
                .push_back(Bytes::from(serde_json::to_vec(&meta).expect("plain object")));
        }

        self.queue
            .extend(listing.expand(host.as_deref(), &contents));

        core.ready();
        core.pump();
    }

    fn recv(&mut self, core: &mut ChannelCore, _data: Bytes) {
        core.fail(
            Problem::ProtocolError,
            "received unexpected message in resource channel",
        );
    }

    fn on_event(&mut self, core: &mut ChannelCore, event: ChannelEvent) {
        if let ChannelEvent::Pump = event {
            // One chunk per turn; yields the loop to other channels.
            match self.queue.pop_front() {
                Some(chunk) => {
                    core.send(chunk);
                    core.pump();
                }
                None => core.close(None),
            }
        }
    }
}
