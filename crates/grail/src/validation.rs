//! Request validation and normalization.
//!
//! Every rule reports `InvalidArgument`; messages name the offending input
//! index but are meant for humans only.

use grail_types::{GrailError, Result};

use crate::types::{sniff_image_mime, Input, Output, Request, MAX_FILE_SIZE, MAX_PDF_SIZE, MIME_PDF};

/// Reject malformed requests before any network call.
///
/// Image inputs declared with an empty MIME type have their type sniffed and
/// written back, so providers always see a concrete MIME type.
pub fn validate_request(req: &mut Request) -> Result<()> {
    if req.inputs.is_empty() {
        return Err(GrailError::invalid_argument("inputs must not be empty"));
    }

    match &req.output {
        None => return Err(GrailError::invalid_argument("output must be set")),
        Some(Output::Image(spec)) if spec.count == 0 => {
            return Err(GrailError::invalid_argument("image output count must be at least 1"));
        }
        Some(_) => {}
    }

    if req.options.temperature.is_some() && req.options.top_p.is_some() {
        return Err(GrailError::invalid_argument(
            "temperature and top_p are mutually exclusive",
        ));
    }

    for (i, input) in req.inputs.iter_mut().enumerate() {
        match input {
            Input::Text(_) => {}
            Input::File(file) => {
                file.mime.make_ascii_lowercase();
                let len = file.data.len() as u64;
                if len == 0 {
                    return Err(GrailError::invalid_argument(format!(
                        "input {i}: file data is empty"
                    )));
                }
                if len > MAX_FILE_SIZE {
                    return Err(GrailError::invalid_argument(format!(
                        "input {i}: file is {len} bytes, limit is {MAX_FILE_SIZE}"
                    )));
                }
                if file.mime.is_empty() {
                    match sniff_image_mime(&file.data) {
                        Some(mime) if mime.starts_with("image/") => file.mime = mime.to_string(),
                        _ => {
                            return Err(GrailError::invalid_argument(format!(
                                "input {i}: data is not a recognizable image"
                            )));
                        }
                    }
                }
                if file.mime == MIME_PDF && len > MAX_PDF_SIZE {
                    return Err(GrailError::invalid_argument(format!(
                        "input {i}: PDF is {len} bytes, limit is {MAX_PDF_SIZE}"
                    )));
                }
            }
            Input::FileReader(reader) => {
                reader.mime.make_ascii_lowercase();
                if reader.mime.is_empty() {
                    return Err(GrailError::invalid_argument(format!(
                        "input {i}: file reader requires a MIME type"
                    )));
                }
                if reader.size_hint > MAX_FILE_SIZE {
                    return Err(GrailError::invalid_argument(format!(
                        "input {i}: declared size {} exceeds limit {MAX_FILE_SIZE}",
                        reader.size_hint
                    )));
                }
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GenerationOptions;
    use grail_types::ErrorCode;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR";

    fn request(inputs: Vec<Input>) -> Request {
        Request::new(inputs, Output::text())
    }

    fn assert_invalid(req: &mut Request) {
        let err = validate_request(req).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn empty_inputs_rejected() {
        assert_invalid(&mut request(vec![]));
    }

    #[test]
    fn missing_output_rejected() {
        let mut req = Request {
            inputs: vec![Input::text("hi")],
            ..Default::default()
        };
        assert_invalid(&mut req);
    }

    #[test]
    fn text_inputs_always_valid() {
        let mut req = request(vec![Input::text(""), Input::text("hello")]);
        assert!(validate_request(&mut req).is_ok());
    }

    #[test]
    fn empty_file_rejected() {
        assert_invalid(&mut request(vec![Input::file(Vec::new(), "text/plain")]));
    }

    #[test]
    fn oversized_file_rejected() {
        let data = vec![0u8; MAX_FILE_SIZE as usize + 1];
        assert_invalid(&mut request(vec![Input::file(data, "application/octet-stream")]));
    }

    #[test]
    fn pdf_at_limit_accepted_and_over_limit_rejected() {
        let mut at_limit = request(vec![Input::pdf(vec![b'%'; MAX_PDF_SIZE as usize])]);
        assert!(validate_request(&mut at_limit).is_ok());

        let mut over = request(vec![Input::pdf(vec![b'%'; MAX_PDF_SIZE as usize + 1])]);
        assert_invalid(&mut over);
    }

    #[test]
    fn pdf_mime_is_case_insensitive() {
        let data = vec![b'%'; MAX_PDF_SIZE as usize + 1];
        assert_invalid(&mut request(vec![Input::file(data, "application/PDF")]));

        let mut req = request(vec![Input::file(b"%PDF-1.7".to_vec(), "Application/Pdf")]);
        validate_request(&mut req).unwrap();
        assert_eq!(req.inputs[0].as_file().unwrap().mime, MIME_PDF);
    }

    #[test]
    fn generic_file_may_exceed_pdf_limit() {
        let data = vec![0u8; MAX_PDF_SIZE as usize + 1];
        let mut req = request(vec![Input::file(data, "application/zip")]);
        assert!(validate_request(&mut req).is_ok());
    }

    #[test]
    fn image_mime_is_sniffed_and_written_back() {
        let mut req = request(vec![Input::image(PNG.to_vec())]);
        validate_request(&mut req).unwrap();
        assert_eq!(req.inputs[0].as_file().unwrap().mime, "image/png");
    }

    #[test]
    fn unrecognizable_image_rejected() {
        assert_invalid(&mut request(vec![Input::image(b"definitely not an image".to_vec())]));
    }

    #[test]
    fn file_reader_requires_mime() {
        let reader = Input::file_reader(std::io::Cursor::new(b"data".to_vec()), 4, "");
        assert_invalid(&mut request(vec![reader]));
    }

    #[test]
    fn file_reader_declared_size_checked() {
        let reader = Input::file_reader(
            std::io::Cursor::new(Vec::new()),
            MAX_FILE_SIZE + 1,
            "application/octet-stream",
        );
        assert_invalid(&mut request(vec![reader]));

        let unknown_size = Input::file_reader(std::io::Cursor::new(b"x".to_vec()), 0, "text/plain");
        assert!(validate_request(&mut request(vec![unknown_size])).is_ok());
    }

    #[test]
    fn temperature_and_top_p_are_exclusive() {
        let mut req = request(vec![Input::text("hi")]).with_options(GenerationOptions {
            temperature: Some(0.5),
            top_p: Some(0.9),
            ..Default::default()
        });
        assert_invalid(&mut req);
    }

    #[test]
    fn zero_image_count_rejected() {
        let mut req = Request::new(vec![Input::text("a cat")], Output::image(0));
        assert_invalid(&mut req);
    }

    #[test]
    fn error_names_offending_index() {
        let mut req = request(vec![Input::text("ok"), Input::file(Vec::new(), "image/png")]);
        let err = validate_request(&mut req).unwrap_err();
        assert!(err.message().contains("input 1"));
    }
}
