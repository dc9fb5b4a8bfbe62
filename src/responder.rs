/// Upper-layer diagnostic service that answers reassembled CAN-TP requests.
pub trait Responder {
    /// Handles one complete request. Writes the reply into `response` and
    /// returns its length, or `None` when there is nothing to send back.
    fn respond(&mut self, request: &[u8], response: &mut [u8]) -> Option<usize>;
}

/// Never answers.
impl Responder for () {
    fn respond(&mut self, _request: &[u8], _response: &mut [u8]) -> Option<usize> {
        None
    }
}

impl<R: Responder + ?Sized> Responder for &mut R {
    fn respond(&mut self, request: &[u8], response: &mut [u8]) -> Option<usize> {
        (**self).respond(request, response)
    }
}

/// Service identifiers from here on belong to UDS, everything below is an
/// OBD2 mode.
pub const UDS_SERVICE_BASE: u8 = 0x10;

/// Routes a request to the OBD2 or the UDS responder by its first byte.
#[derive(Debug, Default)]
pub struct DiagnosticRouter<O, U> {
    pub obd: O,
    pub uds: U,
}

impl<O, U> DiagnosticRouter<O, U> {
    pub fn new(obd: O, uds: U) -> Self {
        Self { obd, uds }
    }
}

impl<O: Responder, U: Responder> Responder for DiagnosticRouter<O, U> {
    fn respond(&mut self, request: &[u8], response: &mut [u8]) -> Option<usize> {
        let service = *request.first()?;
        let len = if service >= UDS_SERVICE_BASE {
            self.uds.respond(request, response)?
        } else {
            self.obd.respond(request, response)?
        };

        // a responder claiming more than it was given is treated as silent
        (len <= response.len()).then_some(len)
    }
}
