//! Key-set cursor pagination over job ids.
//!
//! Job ids are time-ordered (UUID v7), so paginating on the id alone gives a
//! stable order. Cursors are opaque base64 strings encoding an id and the
//! direction they were minted for.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::{MonqueError, Result};
use crate::job::Job;
use crate::store::JobFilter;

/// Direction of pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageDirection {
    /// Ascending from the anchor.
    #[default]
    Forward,
    /// Descending from the anchor; the page is presented ascending.
    Backward,
}

/// Opaque cursor: an id plus the direction it points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub id: Uuid,
    pub direction: PageDirection,
}

impl Cursor {
    pub fn new(id: Uuid, direction: PageDirection) -> Self {
        Cursor { id, direction }
    }

    /// Encode as an opaque base64 string.
    pub fn encode(&self) -> String {
        let tag = match self.direction {
            PageDirection::Forward => 'f',
            PageDirection::Backward => 'b',
        };
        URL_SAFE_NO_PAD.encode(format!("{tag}:{}", self.id))
    }

    /// Decode a cursor string. Anything malformed is `InvalidCursor`.
    pub fn decode(raw: &str) -> Result<Self> {
        let invalid = || MonqueError::InvalidCursor {
            cursor: raw.to_string(),
        };
        let bytes = URL_SAFE_NO_PAD.decode(raw).map_err(|_| invalid())?;
        let text = String::from_utf8(bytes).map_err(|_| invalid())?;
        let (tag, id) = text.split_once(':').ok_or_else(invalid)?;
        let direction = match tag {
            "f" => PageDirection::Forward,
            "b" => PageDirection::Backward,
            _ => return Err(invalid()),
        };
        let id = Uuid::parse_str(id).map_err(|_| invalid())?;
        Ok(Cursor { id, direction })
    }
}

/// Options for [`get_jobs_with_cursor`](crate::Monque::get_jobs_with_cursor).
#[derive(Debug, Clone, TypedBuilder)]
pub struct CursorPageOptions {
    /// Resume from this cursor; `None` starts at the corresponding end.
    #[builder(default, setter(strip_option, into))]
    pub cursor: Option<String>,

    /// Page size.
    #[builder(default = 50)]
    pub limit: usize,

    #[builder(default)]
    pub direction: PageDirection,

    #[builder(default)]
    pub filter: JobFilter,
}

impl Default for CursorPageOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// One page of jobs, always presented in ascending id order.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub has_next_page: bool,
    pub has_previous_page: bool,
    /// Cursor of the first job, pointing backward.
    pub start_cursor: Option<String>,
    /// Cursor of the last job, pointing forward.
    pub end_cursor: Option<String>,
}

impl JobPage {
    /// Assemble a page from `limit + 1` fetched rows.
    ///
    /// `rows` arrive in query order: ascending for forward pages, descending
    /// for backward pages. The overflow row only signals `has_more`; backward
    /// pages are reversed for presentation.
    pub(crate) fn assemble(
        mut rows: Vec<Job>,
        limit: usize,
        direction: PageDirection,
        anchored: bool,
    ) -> Self {
        let has_more = rows.len() > limit;
        rows.truncate(limit);
        if direction == PageDirection::Backward {
            rows.reverse();
        }

        let (has_next_page, has_previous_page) = match direction {
            PageDirection::Forward => (has_more, anchored),
            PageDirection::Backward => (anchored, has_more),
        };

        let start_cursor = rows
            .first()
            .map(|job| Cursor::new(job.id, PageDirection::Backward).encode());
        let end_cursor = rows
            .last()
            .map(|job| Cursor::new(job.id, PageDirection::Forward).encode());

        JobPage {
            jobs: rows,
            has_next_page,
            has_previous_page,
            start_cursor,
            end_cursor,
        }
    }
}
