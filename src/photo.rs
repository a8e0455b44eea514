//! # Photo and Stream Loading
//!
//! Display photos resolve in two stages: the contact's photo uri is streamed
//! first, and any read failure falls back to the inline bytes of the photo row
//! named by the contact's photo id. Social stream items are loaded newest
//! first with their photos attached.

use crate::error::StoreError;
use crate::model::{Contact, StreamItemEntry, StreamItemId};
use crate::store::ContactStore;
use rustc_hash::FxHashMap;
use std::io::{self, Read};
use tracing::{debug, trace};

/// Full-size photo for `contact`, or `None` when neither stage yields bytes.
pub fn load_display_photo(
    store: &dyn ContactStore,
    contact: &Contact,
    max_bytes: usize,
) -> Option<Vec<u8>> {
    if let Some(uri) = contact.photo_uri.as_deref() {
        match read_photo(store, uri, max_bytes) {
            Ok(bytes) => return Some(bytes),
            Err(err) => debug!(%uri, error = %err, "photo stream failed, using inline photo"),
        }
    }
    inline_photo(contact)
}

fn read_photo(store: &dyn ContactStore, uri: &str, max_bytes: usize) -> io::Result<Vec<u8>> {
    let reader = store.open_photo(uri)?;
    let mut bytes = Vec::new();
    reader.take(max_bytes as u64 + 1).read_to_end(&mut bytes)?;
    if bytes.len() > max_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("photo exceeds {max_bytes} bytes"),
        ));
    }
    Ok(bytes)
}

/// Inline bytes of the row named by the contact's photo id. A row with that
/// id but another mimetype means no photo.
pub fn inline_photo(contact: &Contact) -> Option<Vec<u8>> {
    let photo_id = contact.photo_id?;
    let item = contact.find_data(photo_id)?;
    match item.kind.as_photo() {
        Some(photo) => photo.thumbnail.clone(),
        None => {
            trace!(data = %photo_id, mimetype = item.mimetype(), "photo id names a non-photo row");
            None
        }
    }
}

/// Stream items of the contact behind `lookup_key`, newest first.
///
/// Profile stream items each live in their own partition, so their photos are
/// read one item at a time; everyone else's are read in one batch.
pub fn load_stream_items(
    store: &dyn ContactStore,
    lookup_key: &str,
    profile: bool,
) -> Result<Vec<StreamItemEntry>, StoreError> {
    let Some(mut items) = store.query_stream_items(lookup_key)? else {
        debug!(%lookup_key, "stream item read returned no rows");
        return Ok(Vec::new());
    };
    if !items.is_empty() {
        if profile {
            for item in &mut items {
                if let Some(photos) = store.query_stream_photos(&[item.id])? {
                    item.photos.extend(photos);
                }
            }
        } else {
            let ids: Vec<StreamItemId> = items.iter().map(|item| item.id).collect();
            let by_id: FxHashMap<StreamItemId, usize> = ids
                .iter()
                .enumerate()
                .map(|(index, id)| (*id, index))
                .collect();
            for photo in store.query_stream_photos(&ids)?.unwrap_or_default() {
                match by_id.get(&photo.stream_item_id) {
                    Some(&index) => items[index].photos.push(photo),
                    None => trace!(item = photo.stream_item_id.0, "photo for unknown stream item"),
                }
            }
        }
    }
    items.sort_by(StreamItemEntry::display_order);
    Ok(items)
}
