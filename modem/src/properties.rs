use serde::Serialize;

/// Mode used for `+CEREG`/`+CGREG`/`+CREG` registration reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationMode {
    Disable,
    Enable,
    /// Report location area code and cell id as well
    Lac,
}

/// What a cellular stack may assume about a module's AT dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CellularProperties {
    pub c_ereg: RegistrationMode,
    pub c_greg: RegistrationMode,
    pub c_reg: RegistrationMode,
    pub at_cgsn_with_type: bool,
    pub at_cgdata: bool,
    pub at_cgauth: bool,
    pub at_cnmi: bool,
    pub at_csmp: bool,
    pub at_cmgf: bool,
    pub at_csdh: bool,
    pub ipv4_stack: bool,
    pub ipv6_stack: bool,
    pub ipv4v6_stack: bool,
    pub non_ip_pdp_type: bool,
    pub at_cgerep: bool,
    pub at_cops_fallback_auto: bool,
    /// Sockets served by the module's own IP stack
    pub socket_count: u8,
    pub ip_tcp: bool,
    pub ip_udp: bool,
    pub at_send_delay_ms: u32,
}

/// EC2x: data goes over PPP, so the module's internal IP stack is unused.
pub const EC2X_PROPERTIES: CellularProperties = CellularProperties {
    c_ereg: RegistrationMode::Lac,
    c_greg: RegistrationMode::Lac,
    c_reg: RegistrationMode::Lac,
    at_cgsn_with_type: false,
    // +CGDATA misbehaves on this module, dial with ATD instead
    at_cgdata: false,
    at_cgauth: false,
    at_cnmi: true,
    at_csmp: true,
    at_cmgf: true,
    at_csdh: true,
    ipv4_stack: true,
    ipv6_stack: true,
    ipv4v6_stack: true,
    non_ip_pdp_type: false,
    at_cgerep: true,
    at_cops_fallback_auto: true,
    socket_count: 0,
    ip_tcp: false,
    ip_udp: false,
    at_send_delay_ms: 0,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_registration_modes_in_snake_case() {
        let v = serde_json::to_value(EC2X_PROPERTIES).unwrap();
        assert_eq!(v["c_ereg"], "lac");
        assert_eq!(v["socket_count"], 0);
        assert_eq!(v["at_cgdata"], false);
    }
}
