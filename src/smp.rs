// SPDX-License-Identifier: LGPL-3.0-only

use num_bigint::BigUint;
use thiserror::Error;
use zeroize::Zeroize;

use crate::{
    crypto::{
        constant,
        dh::{self, Exponent},
        dsa, sha256, CryptoError,
    },
    encoding::{OTRDecoder, OTREncoder, TLV, TLV_MAX_VALUE_LEN},
    events::SMPEvent,
    TLVType, SSID,
};

const TLV_SMP_MESSAGE_1: TLVType = 2;
const TLV_SMP_MESSAGE_2: TLVType = 3;
const TLV_SMP_MESSAGE_3: TLVType = 4;
const TLV_SMP_MESSAGE_4: TLVType = 5;
const TLV_SMP_ABORT: TLVType = 6;
/// TLV similar to message 1 but includes a user-specified question (null-terminated) in the payload.
const TLV_SMP_MESSAGE_1Q: TLVType = 7;

const SMP_VERSION: u8 = 1;

/// `MAX_QUESTION_LEN` is the longest question that fits in message 1Q, next to the NULL-byte and
/// the six MPIs of message 1.
pub const MAX_QUESTION_LEN: usize = TLV_MAX_VALUE_LEN - 1 - 4 - 6 * (4 + dh::ELEMENT_LEN);

const PROGRESS_ASK_SECRET: u8 = 25;
const PROGRESS_IN_PROGRESS: u8 = 60;
const PROGRESS_COMPLETED: u8 = 100;
const PROGRESS_RESET: u8 = 0;

pub fn is_smp_tlv(tlv: &TLV) -> bool {
    matches!(
        tlv.0,
        TLV_SMP_MESSAGE_1
            | TLV_SMP_MESSAGE_2
            | TLV_SMP_MESSAGE_3
            | TLV_SMP_MESSAGE_4
            | TLV_SMP_ABORT
            | TLV_SMP_MESSAGE_1Q
    )
}

/// `SMPContext` is the Socialist Millionaire's Protocol for a single confidential session.
///
/// The secret is bound to the session: both fingerprints (initiator first) and the SSID are
/// hashed together with the user-provided secret.
pub struct SMPContext {
    state: SMPState,
    our_fingerprint: dsa::Fingerprint,
    their_fingerprint: dsa::Fingerprint,
    ssid: SSID,
    /// Whether each state that was left behind was wiped completely.
    #[cfg(test)]
    wiped: Vec<bool>,
}

impl Drop for SMPContext {
    fn drop(&mut self) {
        self.state.zeroize();
        self.ssid.fill(0);
    }
}

#[allow(non_snake_case)]
impl SMPContext {
    pub fn new(
        our_fingerprint: dsa::Fingerprint,
        their_fingerprint: dsa::Fingerprint,
        ssid: SSID,
    ) -> Self {
        Self {
            state: SMPState::Expect1,
            our_fingerprint,
            their_fingerprint,
            ssid,
            #[cfg(test)]
            wiped: Vec::new(),
        }
    }

    /// `in_progress` indicates whether an SMP exchange is in flight.
    pub fn in_progress(&self) -> bool {
        !matches!(self.state, SMPState::Expect1)
    }

    /// `waiting_for_secret` indicates that the other party initiated SMP and the user's secret is
    /// needed to continue.
    pub fn waiting_for_secret(&self) -> bool {
        matches!(self.state, SMPState::WaitingForSecret { .. })
    }

    /// `initiate` starts a new exchange, producing SMP message 1, or message 1Q if a question is
    /// provided. Any exchange in progress is discarded.
    pub fn initiate(&mut self, secret: &[u8], question: &[u8]) -> Result<TLV, SMPError> {
        let g = dh::generator();
        let a2 = Exponent::random_mod_q()?;
        let a3 = Exponent::random_mod_q()?;
        let r2 = Exponent::random_mod_q()?;
        let r3 = Exponent::random_mod_q()?;
        let g2a = dh::modpow_secret(g, &a2);
        let g3a = dh::modpow_secret(g, &a3);
        let c2 = hash(1, &dh::modpow_secret(g, &r2), None);
        let D2 = dh::sub_mul_mod_q(&r2, &a2, &c2);
        let c3 = hash(2, &dh::modpow_secret(g, &r3), None);
        let D3 = dh::sub_mul_mod_q(&r3, &a3, &c3);
        let x = compute_secret(&self.our_fingerprint, &self.their_fingerprint, &self.ssid, secret);
        let mut encoder = OTREncoder::new();
        let typ = if question.is_empty() {
            TLV_SMP_MESSAGE_1
        } else {
            encoder.write_bytes_null_terminated(question);
            TLV_SMP_MESSAGE_1Q
        };
        encoder.write_mpi_sequence(&[&g2a, &c2, &D2, &g3a, &c3, &D3]);
        log::info!("SMP initiated.");
        self.transition(SMPState::Expect2 { x, a2, a3 });
        Ok(TLV(typ, encoder.to_vec()))
    }

    /// `abort` resets the exchange and produces the abort TLV for the other party.
    pub fn abort(&mut self) -> TLV {
        self.reset();
        TLV(TLV_SMP_ABORT, Vec::new())
    }

    fn reset(&mut self) {
        self.transition(SMPState::Expect1);
    }

    /// `transition` moves to the next state. The previous state is wiped.
    fn transition(&mut self, next: SMPState) {
        let mut previous = std::mem::replace(&mut self.state, next);
        previous.zeroize();
        #[cfg(test)]
        self.wiped.push(previous.is_wiped());
    }

    /// `handle` processes a received SMP TLV. It returns the TLV to send in response (if any), and
    /// the event with progress (percentage) to report to the user. Verification failures and
    /// unexpected messages reset the exchange and produce an abort TLV.
    ///
    /// # Errors
    ///
    /// `SMPError::Malformed` if the payload cannot be decoded. The message is discarded and the
    /// state is left as is.
    pub fn handle(&mut self, tlv: &TLV) -> Result<(Option<TLV>, SMPEvent, u8), SMPError> {
        let result = match tlv.0 {
            TLV_SMP_ABORT => {
                log::info!("SMP aborted by other party.");
                self.reset();
                return Ok((None, SMPEvent::Abort, PROGRESS_RESET));
            }
            TLV_SMP_MESSAGE_1 | TLV_SMP_MESSAGE_1Q => self.handle_message_1(tlv),
            TLV_SMP_MESSAGE_2 => self.handle_message_2(tlv),
            TLV_SMP_MESSAGE_3 => self.handle_message_3(tlv),
            TLV_SMP_MESSAGE_4 => self.handle_message_4(tlv),
            _ => panic!("BUG: unsupported TLV passed to SMP"),
        };
        match result {
            Ok(outcome) => Ok(outcome),
            Err(err @ SMPError::Malformed(_)) => {
                log::warn!("Ignoring SMP message (type {}): {}", tlv.0, err);
                Err(err)
            }
            Err(SMPError::UnexpectedMessage) => {
                log::info!("Unexpected SMP message (type {}); resetting.", tlv.0);
                Ok((Some(self.abort()), SMPEvent::Error, PROGRESS_RESET))
            }
            Err(err) => {
                log::info!("SMP verification failed: {}", err);
                Ok((Some(self.abort()), SMPEvent::Cheated, PROGRESS_RESET))
            }
        }
    }

    /// `handle_message_1` verifies SMP message 1. The user's secret is needed before continuing.
    fn handle_message_1(&mut self, tlv: &TLV) -> Result<(Option<TLV>, SMPEvent, u8), SMPError> {
        let mut decoder = OTRDecoder::new(&tlv.1);
        let question = if tlv.0 == TLV_SMP_MESSAGE_1Q {
            decoder.read_bytes_null_terminated()
        } else {
            Vec::new()
        };
        let [g2a, c2, D2, g3a, c3, D3] = read_mpis::<6>(decoder)?;
        if !matches!(self.state, SMPState::Expect1) {
            return Err(SMPError::UnexpectedMessage);
        }
        dh::verify_public_key(&g2a)?;
        dh::verify_public_key(&g3a)?;
        dh::verify_exponent(&D2)?;
        dh::verify_exponent(&D3)?;
        verify_zkp(&c2, &D2, &g2a, 1)?;
        verify_zkp(&c3, &D3, &g3a, 2)?;
        log::debug!("SMP message 1 verified.");
        let event = if question.is_empty() {
            SMPEvent::AskForSecret
        } else {
            SMPEvent::AskForAnswer(question.clone())
        };
        self.transition(SMPState::WaitingForSecret { question, g2a, g3a });
        Ok((None, event, PROGRESS_ASK_SECRET))
    }

    /// `respond` continues the exchange initiated by the other party, using the secret provided by
    /// the user. It produces SMP message 2.
    pub fn respond(&mut self, secret: &[u8]) -> Result<TLV, SMPError> {
        let SMPState::WaitingForSecret { g2a, g3a, .. } = &self.state else {
            return Err(SMPError::IncorrectState(
                "No SMP exchange is waiting for a secret.",
            ));
        };
        let g = dh::generator();
        let y = compute_secret(&self.their_fingerprint, &self.our_fingerprint, &self.ssid, secret);
        let b2 = Exponent::random_mod_q()?;
        let b3 = Exponent::random_mod_q()?;
        let r2 = Exponent::random_mod_q()?;
        let r3 = Exponent::random_mod_q()?;
        let r4 = Exponent::random_mod_q()?;
        let r5 = Exponent::random_mod_q()?;
        let r6 = Exponent::random_mod_q()?;
        let g2b = dh::modpow_secret(g, &b2);
        let g3b = dh::modpow_secret(g, &b3);
        let c2 = hash(3, &dh::modpow_secret(g, &r2), None);
        let D2 = dh::sub_mul_mod_q(&r2, &b2, &c2);
        let c3 = hash(4, &dh::modpow_secret(g, &r3), None);
        let D3 = dh::sub_mul_mod_q(&r3, &b3, &c3);
        let g2 = dh::modpow_secret(g2a, &b2);
        let g3 = dh::modpow_secret(g3a, &b3);
        let Pb = dh::modpow_secret(&g3, &r4);
        let Qb = dh::mul(&dh::modpow_secret(g, &r4), &dh::modpow_secret(&g2, &y));
        let cP = hash(
            5,
            &dh::modpow_secret(&g3, &r5),
            Some(&dh::mul(
                &dh::modpow_secret(g, &r5),
                &dh::modpow_secret(&g2, &r6),
            )),
        );
        let D5 = dh::sub_mul_mod_q(&r5, &r4, &cP);
        let D6 = dh::sub_mul_mod_q(&r6, &y, &cP);
        let payload = OTREncoder::new()
            .write_mpi_sequence(&[&g2b, &c2, &D2, &g3b, &c3, &D3, &Pb, &Qb, &cP, &D5, &D6])
            .to_vec();
        let next = SMPState::Expect3 {
            g3a: g3a.clone(),
            g2,
            g3,
            b3,
            Pb,
            Qb,
        };
        self.transition(next);
        Ok(TLV(TLV_SMP_MESSAGE_2, payload))
    }

    /// `handle_message_2` verifies SMP message 2 and produces SMP message 3.
    fn handle_message_2(&mut self, tlv: &TLV) -> Result<(Option<TLV>, SMPEvent, u8), SMPError> {
        let [g2b, c2, D2, g3b, c3, D3, Pb, Qb, cP, D5, D6] =
            read_mpis::<11>(OTRDecoder::new(&tlv.1))?;
        let SMPState::Expect2 { x, a2, a3 } = &self.state else {
            return Err(SMPError::UnexpectedMessage);
        };
        dh::verify_public_key(&g2b)?;
        dh::verify_public_key(&g3b)?;
        dh::verify_public_key(&Pb)?;
        dh::verify_public_key(&Qb)?;
        dh::verify_exponent(&D2)?;
        dh::verify_exponent(&D3)?;
        dh::verify_exponent(&D5)?;
        dh::verify_exponent(&D6)?;
        verify_zkp(&c2, &D2, &g2b, 3)?;
        verify_zkp(&c3, &D3, &g3b, 4)?;
        let g = dh::generator();
        let g2 = dh::modpow_secret(&g2b, a2);
        let g3 = dh::modpow_secret(&g3b, a3);
        constant::verify_biguint(
            &cP,
            &hash(
                5,
                &dh::mul(&dh::modpow(&g3, &D5), &dh::modpow(&Pb, &cP)),
                Some(&dh::mul(
                    &dh::mul(&dh::modpow(g, &D5), &dh::modpow(&g2, &D6)),
                    &dh::modpow(&Qb, &cP),
                )),
            ),
        )?;
        log::debug!("SMP message 2 verified.");
        let r4 = Exponent::random_mod_q()?;
        let r5 = Exponent::random_mod_q()?;
        let r6 = Exponent::random_mod_q()?;
        let r7 = Exponent::random_mod_q()?;
        let Pa = dh::modpow_secret(&g3, &r4);
        let Qa = dh::mul(&dh::modpow_secret(g, &r4), &dh::modpow_secret(&g2, x));
        let cP = hash(
            6,
            &dh::modpow_secret(&g3, &r5),
            Some(&dh::mul(
                &dh::modpow_secret(g, &r5),
                &dh::modpow_secret(&g2, &r6),
            )),
        );
        let D5 = dh::sub_mul_mod_q(&r5, &r4, &cP);
        let D6 = dh::sub_mul_mod_q(&r6, x, &cP);
        let QaQb = dh::mul(&Qa, &dh::inverse(&Qb));
        let PaPb = dh::mul(&Pa, &dh::inverse(&Pb));
        let Ra = dh::modpow_secret(&QaQb, a3);
        let cR = hash(
            7,
            &dh::modpow_secret(g, &r7),
            Some(&dh::modpow_secret(&QaQb, &r7)),
        );
        let D7 = dh::sub_mul_mod_q(&r7, a3, &cR);
        let payload = OTREncoder::new()
            .write_mpi_sequence(&[&Pa, &Qa, &cP, &D5, &D6, &Ra, &cR, &D7])
            .to_vec();
        let next = SMPState::Expect4 {
            g3b,
            PaPb,
            QaQb,
            a3: a3.clone(),
        };
        self.transition(next);
        Ok((
            Some(TLV(TLV_SMP_MESSAGE_3, payload)),
            SMPEvent::InProgress,
            PROGRESS_IN_PROGRESS,
        ))
    }

    /// `handle_message_3` verifies SMP message 3, concludes the exchange on our side and produces
    /// SMP message 4 such that the other party can conclude as well.
    fn handle_message_3(&mut self, tlv: &TLV) -> Result<(Option<TLV>, SMPEvent, u8), SMPError> {
        let [Pa, Qa, cP, D5, D6, Ra, cR, D7] = read_mpis::<8>(OTRDecoder::new(&tlv.1))?;
        let SMPState::Expect3 {
            g3a,
            g2,
            g3,
            b3,
            Pb,
            Qb,
        } = &self.state
        else {
            return Err(SMPError::UnexpectedMessage);
        };
        dh::verify_public_key(&Pa)?;
        dh::verify_public_key(&Qa)?;
        dh::verify_public_key(&Ra)?;
        dh::verify_exponent(&D5)?;
        dh::verify_exponent(&D6)?;
        dh::verify_exponent(&D7)?;
        let g = dh::generator();
        constant::verify_biguint(
            &cP,
            &hash(
                6,
                &dh::mul(&dh::modpow(g3, &D5), &dh::modpow(&Pa, &cP)),
                Some(&dh::mul(
                    &dh::mul(&dh::modpow(g, &D5), &dh::modpow(g2, &D6)),
                    &dh::modpow(&Qa, &cP),
                )),
            ),
        )?;
        let QaQb = dh::mul(&Qa, &dh::inverse(Qb));
        constant::verify_biguint(
            &cR,
            &hash(
                7,
                &dh::mul(&dh::modpow(g, &D7), &dh::modpow(g3a, &cR)),
                Some(&dh::mul(&dh::modpow(&QaQb, &D7), &dh::modpow(&Ra, &cR))),
            ),
        )?;
        log::debug!("SMP message 3 verified.");
        let r7 = Exponent::random_mod_q()?;
        let Rb = dh::modpow_secret(&QaQb, b3);
        let cR = hash(
            8,
            &dh::modpow_secret(g, &r7),
            Some(&dh::modpow_secret(&QaQb, &r7)),
        );
        let D7 = dh::sub_mul_mod_q(&r7, b3, &cR);
        let payload = OTREncoder::new()
            .write_mpi_sequence(&[&Rb, &cR, &D7])
            .to_vec();
        let PaPb = dh::mul(&Pa, &dh::inverse(Pb));
        let Rab = dh::modpow_secret(&Ra, b3);
        let event = conclude(&Rab, &PaPb);
        self.reset();
        Ok((
            Some(TLV(TLV_SMP_MESSAGE_4, payload)),
            event,
            PROGRESS_COMPLETED,
        ))
    }

    /// `handle_message_4` verifies SMP message 4 and concludes the exchange.
    fn handle_message_4(&mut self, tlv: &TLV) -> Result<(Option<TLV>, SMPEvent, u8), SMPError> {
        let [Rb, cR, D7] = read_mpis::<3>(OTRDecoder::new(&tlv.1))?;
        let SMPState::Expect4 {
            g3b,
            PaPb,
            QaQb,
            a3,
        } = &self.state
        else {
            return Err(SMPError::UnexpectedMessage);
        };
        dh::verify_public_key(&Rb)?;
        dh::verify_exponent(&D7)?;
        let g = dh::generator();
        constant::verify_biguint(
            &cR,
            &hash(
                8,
                &dh::mul(&dh::modpow(g, &D7), &dh::modpow(g3b, &cR)),
                Some(&dh::mul(&dh::modpow(QaQb, &D7), &dh::modpow(&Rb, &cR))),
            ),
        )?;
        log::debug!("SMP message 4 verified.");
        let Rab = dh::modpow_secret(&Rb, a3);
        let event = conclude(&Rab, PaPb);
        self.reset();
        Ok((None, event, PROGRESS_COMPLETED))
    }
}

/// `conclude` determines the outcome of the exchange: the secrets are equal iff `Rab == Pa/Pb`.
fn conclude(rab: &BigUint, papb: &BigUint) -> SMPEvent {
    if constant::verify_biguint(rab, papb).is_ok() {
        log::info!("SMP concluded: secrets are equal.");
        SMPEvent::Success
    } else {
        log::info!("SMP concluded: secrets differ.");
        SMPEvent::Failure
    }
}

fn read_mpis<const N: usize>(mut decoder: OTRDecoder) -> Result<[BigUint; N], SMPError> {
    let mpis = decoder
        .read_mpi_sequence()
        .or(Err(SMPError::Malformed("failed to read MPI values")))?;
    decoder
        .done()
        .or(Err(SMPError::Malformed("data left over in buffer")))?;
    mpis.try_into()
        .or(Err(SMPError::Malformed("unexpected number of MPI values")))
}

/// `compute_secret` computes the SMP secret value from the user-provided secret.
fn compute_secret(
    initiator: &dsa::Fingerprint,
    responder: &dsa::Fingerprint,
    ssid: &SSID,
    secret: &[u8],
) -> Exponent {
    let mut data = OTREncoder::new()
        .write_u8(SMP_VERSION)
        .write(initiator)
        .write(responder)
        .write(ssid)
        .write(secret)
        .to_vec();
    let mut digest = sha256::digest(&data);
    let x = Exponent::from_bytes_be(&digest);
    data.fill(0);
    digest.fill(0);
    x
}

/// `hash` computes the challenge: SHA256 over the version byte followed by one or two MPIs.
fn hash(version: u8, mpi1: &BigUint, mpi2: Option<&BigUint>) -> BigUint {
    let mut encoder = OTREncoder::new();
    encoder.write_u8(version).write_mpi(mpi1);
    if let Some(mpi2) = mpi2 {
        encoder.write_mpi(mpi2);
    }
    BigUint::from_bytes_be(&sha256::digest(&encoder.to_vec()))
}

/// `verify_zkp` verifies proof of knowledge of the exponent of `public`: `c == h(g^d * public^c)`.
fn verify_zkp(c: &BigUint, d: &BigUint, public: &BigUint, version: u8) -> Result<(), SMPError> {
    let expected = hash(
        version,
        &dh::mul(&dh::modpow(dh::generator(), d), &dh::modpow(public, c)),
        None,
    );
    constant::verify_biguint(c, &expected)?;
    Ok(())
}

/// `SMPState` is the state of the exchange. Secret exponents are wiped when dropped.
#[allow(non_snake_case)]
enum SMPState {
    Expect1,
    WaitingForSecret {
        question: Vec<u8>,
        g2a: BigUint,
        g3a: BigUint,
    },
    Expect2 {
        x: Exponent,
        a2: Exponent,
        a3: Exponent,
    },
    Expect3 {
        g3a: BigUint,
        g2: BigUint,
        g3: BigUint,
        b3: Exponent,
        Pb: BigUint,
        Qb: BigUint,
    },
    Expect4 {
        g3b: BigUint,
        PaPb: BigUint,
        QaQb: BigUint,
        a3: Exponent,
    },
}

#[allow(non_snake_case)]
impl Zeroize for SMPState {
    fn zeroize(&mut self) {
        match self {
            SMPState::Expect1 => {}
            SMPState::WaitingForSecret { question, g2a, g3a } => {
                question.zeroize();
                g2a.zeroize();
                g3a.zeroize();
            }
            SMPState::Expect2 { x, a2, a3 } => {
                x.zeroize();
                a2.zeroize();
                a3.zeroize();
            }
            SMPState::Expect3 {
                g3a,
                g2,
                g3,
                b3,
                Pb,
                Qb,
            } => {
                g3a.zeroize();
                g2.zeroize();
                g3.zeroize();
                b3.zeroize();
                Pb.zeroize();
                Qb.zeroize();
            }
            SMPState::Expect4 {
                g3b,
                PaPb,
                QaQb,
                a3,
            } => {
                g3b.zeroize();
                PaPb.zeroize();
                QaQb.zeroize();
                a3.zeroize();
            }
        }
    }
}

#[cfg(test)]
#[allow(non_snake_case)]
impl SMPState {
    fn is_wiped(&self) -> bool {
        let zero = |v: &BigUint| v.to_bytes_be().iter().all(|b| *b == 0);
        match self {
            SMPState::Expect1 => true,
            SMPState::WaitingForSecret { question, g2a, g3a } => {
                question.is_empty() && zero(g2a) && zero(g3a)
            }
            SMPState::Expect2 { x, a2, a3 } => x.is_zero() && a2.is_zero() && a3.is_zero(),
            SMPState::Expect3 {
                g3a,
                g2,
                g3,
                b3,
                Pb,
                Qb,
            } => zero(g3a) && zero(g2) && zero(g3) && b3.is_zero() && zero(Pb) && zero(Qb),
            SMPState::Expect4 {
                g3b,
                PaPb,
                QaQb,
                a3,
            } => zero(g3b) && zero(PaPb) && zero(QaQb) && a3.is_zero(),
        }
    }
}

/// `SMPError` contains the errors that occur during the socialist millionaire's protocol.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum SMPError {
    /// The caller requested an action that is invalid in the current state.
    #[error("incorrect state: {0}")]
    IncorrectState(&'static str),
    /// The received SMP message is not expected in the current state.
    #[error("unexpected SMP message")]
    UnexpectedMessage,
    /// The received SMP message cannot be decoded.
    #[error("malformed SMP message: {0}")]
    Malformed(&'static str),
    #[error("cryptographic violation: {0}")]
    CryptographicViolation(#[from] CryptoError),
}
