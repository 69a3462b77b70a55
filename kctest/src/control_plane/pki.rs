//! Credentials for a control-plane emulator: a CA, a serving certificate signed by it, a
//! service-account signing key and an administrator bearer token.

use super::error::{self, Result};
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use snafu::ResultExt;
use std::net::IpAddr;

pub(super) struct Credentials {
    pub(super) ca_cert_pem: String,
    pub(super) serving_cert_pem: String,
    pub(super) serving_key_pem: String,
    pub(super) service_account_key_pem: String,
    pub(super) token: String,
}

impl Credentials {
    /// Generate fresh credentials whose serving certificate is valid for `hosts`, which may be IP
    /// addresses or DNS names.
    pub(super) fn generate(hosts: &[&str]) -> Result<Self> {
        let ca_key = KeyPair::generate().context(error::CertificateSnafu {
            what: "CA key",
        })?;
        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name = distinguished_name("kctest-ca");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_cert_pem = ca_params
            .self_signed(&ca_key)
            .context(error::CertificateSnafu {
                what: "CA certificate",
            })?
            .pem();

        let serving_key = KeyPair::generate().context(error::CertificateSnafu {
            what: "serving key",
        })?;
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name("kube-apiserver");
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.subject_alt_names = hosts
            .iter()
            .map(|host| subject_alt_name(host))
            .collect::<Result<Vec<_>>>()?;
        let issuer =
            Issuer::from_ca_cert_pem(&ca_cert_pem, &ca_key).context(error::CertificateSnafu {
                what: "certificate issuer",
            })?;
        let serving_cert_pem = params
            .signed_by(&serving_key, &issuer)
            .context(error::CertificateSnafu {
                what: "serving certificate",
            })?
            .pem();

        let service_account_key = KeyPair::generate().context(error::CertificateSnafu {
            what: "service account key",
        })?;

        Ok(Self {
            ca_cert_pem,
            serving_cert_pem,
            serving_key_pem: serving_key.serialize_pem(),
            service_account_key_pem: service_account_key.serialize_pem(),
            token: format!("{:032x}", rand::random::<u128>()),
        })
    }

    /// A static token file granting the token cluster-admin through `system:masters`.
    pub(super) fn token_file(&self) -> String {
        format!("{},kctest-admin,kctest-admin,\"system:masters\"\n", self.token)
    }
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn
}

fn subject_alt_name(host: &str) -> Result<SanType> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    Ia5String::try_from(host.to_string())
        .map(SanType::DnsName)
        .context(error::CertificateSnafu {
            what: format!("subject alternative name '{}'", host),
        })
}
