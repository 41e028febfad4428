use exposure_common::{is_allowed_image_url, Item, ScanCursor};

/// One image selected for a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub item_index: usize,
    pub image_index: usize,
    pub url: String,
}

/// The next unit of work and where the cursor lands after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Cursor the batch started from. A rate-limited batch is retried from here.
    pub start: ScanCursor,
    /// Allow-listed images to send. May be empty if every walked image was refused.
    pub images: Vec<ImageRef>,
    /// Images walked over but refused by the host allow-list.
    pub refused: usize,
    /// `None` when the batch reaches the end of the last item.
    pub next: Option<ScanCursor>,
}

impl Batch {
    /// Distinct item indexes in the batch, in walk order.
    pub fn item_indexes(&self) -> Vec<usize> {
        let mut out: Vec<usize> = Vec::new();
        for image in &self.images {
            if out.last() != Some(&image.item_index) {
                out.push(image.item_index);
            }
        }
        out
    }
}

pub fn total_images(items: &[Item]) -> usize {
    items.iter().map(|it| it.images.len()).sum()
}

/// Move `cursor` onto the next real image, skipping image-less items and
/// positions past an item's last image. `None` means the scan is finished.
pub fn normalize(items: &[Item], cursor: ScanCursor) -> Option<ScanCursor> {
    let mut item_index = cursor.item_index;
    let mut image_index = cursor.image_index;

    while let Some(item) = items.get(item_index) {
        if image_index < item.images.len() {
            return Some(ScanCursor::new(item_index, image_index));
        }
        item_index += 1;
        image_index = 0;
    }
    None
}

/// Select up to `max_batch` allow-listed images starting at `cursor`.
///
/// Refused images are skipped without counting toward the batch but still
/// move the cursor. Returns `None` when there is nothing left to walk.
pub fn next_batch(
    items: &[Item],
    cursor: ScanCursor,
    max_batch: usize,
    trusted_hosts: &[String],
) -> Option<Batch> {
    let start = normalize(items, cursor)?;
    let max_batch = max_batch.max(1);

    let mut item_index = start.item_index;
    let mut image_index = start.image_index;
    let mut images = Vec::new();
    let mut refused = 0;

    while images.len() < max_batch {
        let Some(item) = items.get(item_index) else {
            break;
        };
        let Some(url) = item.images.get(image_index) else {
            item_index += 1;
            image_index = 0;
            continue;
        };

        if is_allowed_image_url(url, trusted_hosts) {
            images.push(ImageRef {
                item_index,
                image_index,
                url: url.clone(),
            });
        } else {
            refused += 1;
        }
        image_index += 1;
    }

    Some(Batch {
        start,
        images,
        refused,
        next: normalize(items, ScanCursor::new(item_index, image_index)),
    })
}

/// Number of images before `cursor`. A finished scan (`None`) counts every image.
pub fn absolute_progress(items: &[Item], cursor: Option<ScanCursor>) -> usize {
    let Some(cursor) = cursor else {
        return total_images(items);
    };

    let before: usize = items
        .iter()
        .take(cursor.item_index)
        .map(|it| it.images.len())
        .sum();
    let within = items
        .get(cursor.item_index)
        .map(|it| cursor.image_index.min(it.images.len()))
        .unwrap_or(0);
    before + within
}
