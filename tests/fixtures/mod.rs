//! SAT portal pages and sample invoices used across the integration tests

/// Sample by-reference lookup
#[derive(Debug, Clone)]
pub struct InvoiceFixture {
    pub folio: &'static str,
    pub issuer_rfc: &'static str,
    pub issuer_name: &'static str,
    pub receiver_rfc: &'static str,
    pub receiver_name: &'static str,
    pub description: &'static str,
}

pub const ACTIVE_INVOICE: InvoiceFixture = InvoiceFixture {
    folio: "9FD4B473-1EE0-42E2-9D29-5DAEC8057A18",
    issuer_rfc: "DORA990310A30",
    issuer_name: "Juan Pérez Dorantes",
    receiver_rfc: "REGL960120LPA",
    receiver_name: "María López Regalado",
    description: "Active income invoice",
};

pub const CANCELLED_INVOICE: InvoiceFixture = InvoiceFixture {
    folio: "3A7C0E21-55B4-4F0D-8E1A-0C2B9D8F7E61",
    issuer_rfc: "EKU9003173C9",
    issuer_name: "Escuela Kemper Urgate",
    receiver_rfc: "XAXX010101000",
    receiver_name: "Público en general",
    description: "Invoice cancelled by the issuer",
};

/// Portal response for an active CFDI, shaped like the live result tables
pub fn active_page(invoice: &InvoiceFixture) -> String {
    active_page_for(invoice, invoice.folio)
}

/// Same as [`active_page`], reporting `folio` as the folio fiscal
pub fn active_page_for(invoice: &InvoiceFixture, folio: &str) -> String {
    format!(
        r#"<html><body>
<div id="ctl00_MainContent_PnlResultados">
  <table>
    <tr><th>RFC del emisor</th><th>Nombre o razón social del emisor</th><th>RFC del receptor</th><th>Nombre o razón social del receptor</th></tr>
    <tr><td> {issuer_rfc} </td><td>{issuer_name}</td><td>{receiver_rfc}</td><td>{receiver_name}</td></tr>
  </table>
  <table>
    <tr><th>Folio fiscal</th><th>Fecha de expedición</th><th>Fecha certificación SAT</th><th>PAC que certificó</th></tr>
    <tr><td>{folio}</td><td>2024-01-15T10:30:00</td><td>2024-01-15T10:31:12</td><td>SAT970701NN3</td></tr>
  </table>
  <table>
    <tr><th>Total del CFDI</th><th>Efecto del comprobante</th><th>Estado CFDI</th><th>Estatus de cancelación</th></tr>
    <tr><td>$58,000.00</td><td>Ingreso</td><td>Vigente</td><td>Cancelable sin aceptación</td></tr>
  </table>
</div>
</body></html>"#,
        issuer_rfc = invoice.issuer_rfc,
        issuer_name = invoice.issuer_name,
        receiver_rfc = invoice.receiver_rfc,
        receiver_name = invoice.receiver_name,
        folio = folio,
    )
}

/// Portal response for a cancelled CFDI
pub fn cancelled_page(invoice: &InvoiceFixture) -> String {
    format!(
        r#"<html><body>
<table>
  <tr><td>{issuer_rfc}</td><td>{issuer_name}</td><td>{receiver_rfc}</td><td>{receiver_name}</td></tr>
  <tr><td>{folio}</td><td>2023-11-02T08:15:00</td><td>2023-11-02T08:16:40</td><td>SAT970701NN3</td></tr>
  <tr><td>$1,160.00</td><td>Ingreso</td><td>Cancelado</td><td>Cancelable con aceptación</td></tr>
  <tr><td>Cancelado con aceptación</td><td>2024-03-02T12:00:00</td></tr>
</table>
</body></html>"#,
        issuer_rfc = invoice.issuer_rfc,
        issuer_name = invoice.issuer_name,
        receiver_rfc = invoice.receiver_rfc,
        receiver_name = invoice.receiver_name,
        folio = invoice.folio,
    )
}

/// Portal response when the triple does not match any CFDI
pub const NOT_FOUND_PAGE: &str = r#"<html><body>
<div class="alert">No se encontró el comprobante con los datos proporcionados.</div>
</body></html>"#;

/// Portal response to a wrong CAPTCHA answer
pub const CAPTCHA_REJECTED_PAGE: &str = r#"<html><body>
<span id="ctl00_MainContent_LblError">El código de verificación es Incorrecto</span>
</body></html>"#;

/// A minimal CFDI 4.0 document for upload lookups
pub const SAMPLE_CFDI_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<cfdi:Comprobante xmlns:cfdi="http://www.sat.gob.mx/cfd/4" Version="4.0" Total="58000.00">
  <cfdi:Emisor Rfc="DORA990310A30" Nombre="Juan Pérez Dorantes"/>
  <cfdi:Receptor Rfc="REGL960120LPA" Nombre="María López Regalado"/>
</cfdi:Comprobante>"#;

/// Deterministic 36-character folio for batch item `index`
pub fn folio_for(index: usize) -> String {
    format!("00000000-0000-4000-8000-{:012}", index)
}
