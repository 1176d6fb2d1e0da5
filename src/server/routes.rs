//! The prediction route: multipart image upload in, recognized text out

use super::protocol::PredictResponse;
use super::{ServiceError, UploadLimit};
use crate::model::Transcriber;
use actix_multipart::{Field, Multipart};
use actix_web::{post, web, Responder};
use futures::TryStreamExt;
use tracing::{debug, info};

type Result<T> = std::result::Result<T, ServiceError>;

/// Name of the multipart field carrying the image
pub const FILE_FIELD: &str = "file";

/// Handle an HTTP request for handwriting recognition
#[post("/predict")]
pub async fn predict(
    mut payload: Multipart,
    transcriber: web::Data<dyn Transcriber>,
    limit: web::Data<UploadLimit>,
) -> Result<impl Responder> {
    let upload = read_upload(&mut payload, limit.0).await?;
    debug!("received upload of {} bytes", upload.len());

    // Decoding and inference are blocking, keep them off the async workers
    let transcriber = transcriber.into_inner();
    let text = web::block(move || -> Result<String> {
        let image = image::load_from_memory(&upload)?.to_rgb8();
        Ok(transcriber.transcribe(&image)?)
    })
    .await??;

    info!("finished serving inference request");

    Ok(web::Json(PredictResponse { text }))
}

/// Whether `field` is a file upload under [`FILE_FIELD`]. Like a browser
/// form, a part without a filename is a plain value, not a file.
fn is_file_upload(field: &Field) -> bool {
    field.name() == Some(FILE_FIELD)
        && field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .is_some()
}

/// Read the whole file upload into memory
async fn read_upload(payload: &mut Multipart, limit: usize) -> Result<Vec<u8>> {
    loop {
        let mut field = match payload.try_next().await {
            Ok(Some(field)) => field,
            Ok(None) => return Err(ServiceError::NoFile),
            Err(e) => {
                debug!("rejecting request without a readable multipart body: {e}");
                return Err(ServiceError::NoFile);
            }
        };

        if !is_file_upload(&field) {
            // Drain the part before moving on to the next one
            while field.try_next().await?.is_some() {}
            continue;
        }

        let mut data = Vec::new();
        while let Some(chunk) = field.try_next().await? {
            if data.len() + chunk.len() > limit {
                return Err(ServiceError::PayloadTooLarge(limit));
            }
            data.extend_from_slice(&chunk);
        }
        return Ok(data);
    }
}
