#![cfg_attr(not(test), no_std)]
//! DHT20 driver.
//!
//! Example:
//!
//!     # use embedded_hal_mock::eh1::delay::NoopDelay as MockDelay;
//!     # use embedded_hal_mock::eh1::i2c::Mock as I2cMock;
//!     # use embedded_hal_mock::eh1::i2c::Transaction;
//!     # use dht20_driver::{Command, DHT20, SENSOR_ADDRESS};
//!     # let expectations = vec![
//!     #     // The status word reads 0x18 right away, no register resets
//!     #     // are needed.
//!     #     Transaction::write_read(
//!     #         SENSOR_ADDRESS,
//!     #         vec![Command::CheckStatus as u8],
//!     #         vec![0b0001_1000],
//!     #     ),
//!     #     // send_trigger_measurement
//!     #     Transaction::write(
//!     #         SENSOR_ADDRESS,
//!     #         vec![
//!     #             Command::TriggerMeasurement as u8,
//!     #             0b0011_0011, // 0x33
//!     #             0b0000_0000, // 0x00
//!     #         ],
//!     #     ),
//!     #     // The busy bit is already clear on the first status read.
//!     #     Transaction::read(SENSOR_ADDRESS, vec![0b0001_1100]),
//!     #     // We can now read 7 bytes. status byte, 5 data bytes, crc byte.
//!     #     // These are taken from a run of the sensor.
//!     #     Transaction::read(
//!     #         SENSOR_ADDRESS,
//!     #         vec![0x1C, 0x65, 0xB4, 0x25, 0xCD, 0x26, 0xC6],
//!     #     ),
//!     # ];
//!     # let mock_i2c = I2cMock::new(&expectations);
//!     # let mut mock_delay = MockDelay::new();
//!     let mut dht20 = DHT20::new(mock_i2c, SENSOR_ADDRESS, &mut mock_delay).unwrap();
//!     let reading = dht20.read_data(&mut mock_delay).unwrap();
//!
//!     println!("temperature (dht20): {:.2}C", reading.temperature);
//!     println!("humidity (dht20): {:.2}%", reading.humidity);
//!     # let mut mock = dht20.destroy();
//!     # mock.done();
//!
//! [DHT20 Datasheet](https://cdn-shop.adafruit.com/product-files/5183/5193_DHT20.pdf)
//!
//! The DHT20 is the AHT20 die in a four-pin DHT11-style package, so the
//! command set and the payload format are shared across that family. What
//! sets the startup path apart from most I2C sensors is the register
//! reinitialization dance: when the status word does not read exactly 0x18
//! after power-up, the three calibration registers 0x1B, 0x1C and 0x1E
//! each need a clear, read-back and rewrite before measurements can be
//! trusted. The datasheet (section 7.4) points at the vendor init routine
//! for this; the sequence implemented here is that routine.
//!
//! The driver owns the I2C bus it is given and performs blocking
//! transactions on it, one logical operation at a time. If the bus is
//! shared with other devices, hand the driver a shared handle from
//! something like `embedded-hal-bus` and let that layer serialize access.
//!
//! The below is a flowchart of how the sensor gets initialized and
//! measurements taken. Note that the flowchart does not include the
//! parameters that some commands take, and it also doesn't include the
//! SoftReset command flow.
//!
//! ```text
//!           Start (power on)
//!                  │
//!                  ▼
//!             Wait 100 ms
//!                  │
//!                  ▼
//!  Command::CheckStatus (0x71)  ◄── Reset registers 0x1B, 0x1C, 0x1E
//!                  │                             ▲
//!                  ▼                             │
//!       Status word == 0x18 ──► No ──────────────┘
//!                  │              (bounded, then CalibrationTimeout)
//!                 Yes
//!                  │
//!                  ▼
//! Command::TriggerMeasurement (0xAC)
//!                  │
//!                  ▼
//!              Wait 80 ms
//!                  │
//!                  ▼
//!        Read 1 status byte  ◄───── Wait 10 ms
//!                  │                     ▲
//!                  ▼                     │
//!            Status::Busy ──► Yes ───────┘
//!                  │            (bounded, then MeasurementTimeout)
//!                 No
//!                  │
//!                  ▼
//!             Read 7 bytes
//!                  │
//!                  ▼
//!            Calculate CRC
//!                  │
//!                  ▼
//!               CRC good ──► No ──► Error::InvalidCrc
//!                  │
//!                 Yes
//!                  │
//!                  ▼
//!        Calc humidity and temp
//! ```
use crc_any::CRCu8;
use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;

#[cfg(feature = "use-defmt")]
use defmt::Format;

/// DHT20 sensor's I2C address.
pub const SENSOR_ADDRESS: u8 = 0b0011_1000; // This is I2C address 0x38;

/// Calibration registers that need the reset sequence when the status word
/// does not read 0x18 after power-up.
const CALIBRATION_REGISTERS: [u8; 3] = [0x1B, 0x1C, 0x1E];

/// Commands that can be sent to the DHT20 sensor.
///
/// TriggerMeasurement takes two parameter bytes for which no explanation
/// is provided, only the values. Consider the command and its parameters
/// to be one three-byte command. The calibration registers 0x1B, 0x1C and
/// 0x1E are not listed here; they are register addresses, not commands,
/// and are only touched by the reset sequence.
pub enum Command {
    CheckStatus = 0b0111_0001, // 0x71, get a byte of status word.
    // There are two usages for the CheckStatus command. On startup the
    // status word tells you whether the calibration registers need the
    // reset sequence: compare the whole word against Status::Initialized.
    // After a TriggerMeasurement it tells you whether data is ready to be
    // read back: check Status::Busy.
    TriggerMeasurement = 0b1010_1100, // 0xAC
    // This command takes two bytes of parameter: 0b0011_0011 (0x33), then
    // 0b0000_0000 (0x00). Wait 80ms for the measurement. Check the status
    // word for Status::Busy to clear, then read 7 bytes. A status byte, 5
    // data bytes, plus a byte of CRC.
    SoftReset = 0b1011_1010, // 0xBA
    // Shared with the rest of the AHT20 die family. The reset takes 20ms
    // or less to complete.
}

/// Status byte meanings.
///
/// Only the busy flag and the calibration bits carry documented meaning;
/// the remaining bits are reserved.
pub enum Status {
    Busy = 0b1000_0000, // Status bit for busy - 8th bit enabled. 1<<7, 0x80
    // 1 is busy measuring. 0 is "free in dormant state" or "ready".
    CalibrationMask = 0b0110_1000, // 0x68, the calibration indicator bits.
    // The calibration bits only mean something after masking the status
    // word with this value.
    Calibrated = 0b0000_1000, // 0x08, the masked word of a calibrated sensor.
    // Any other masked value means the readings cannot be trusted yet.
    Initialized = 0b0001_1000, // 0x18, the whole status word of a sensor
    // whose calibration registers all hold their reset values. This is an
    // exact byte, not a mask; see SensorStatus::is_initialized.
}

/// SensorStatus is the response from the sensor indicating if it is busy,
/// if it considers itself calibrated, and if its calibration registers
/// have been initialized.
///
/// This is returned from the `read_status` method. It is used during
/// construction, which is when the driver runs the register reset
/// sequence, and during `read_data`, when the sensor reports itself busy
/// for a period of around 80ms.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "use-defmt", derive(Format))]
pub struct SensorStatus(pub u8);

impl SensorStatus {
    /// Create a new SensorStatus from a DHT20 status byte.
    ///
    /// That byte comes from the `read_status` method.
    pub fn new(status: u8) -> Self {
        SensorStatus(status)
    }

    /// Check if the sensor is ready to have data read from it. After
    /// triggering a measurement, the result must not be read back before
    /// this returns true. The `read_data` method takes care of this wait
    /// and check.
    pub fn is_ready(self) -> bool {
        // The busy bit should be 0 (not busy) for the sensor to report ready.
        (self.0 & Status::Busy as u8) == 0
    }

    /// Check if the sensor reports itself calibrated.
    ///
    /// The masked status word must read exactly 0x08. Note that this is a
    /// weaker condition than `is_initialized`: a sensor can pass the mask
    /// check while one of its calibration registers still needs the reset
    /// sequence.
    pub fn is_calibrated(self) -> bool {
        (self.0 & Status::CalibrationMask as u8) == Status::Calibrated as u8
    }

    /// Check if every calibration register holds its reset value.
    ///
    /// The whole status word must read exactly 0x18. This is the
    /// termination condition of the register reset sequence run during
    /// construction; passing `is_calibrated` alone does not end it.
    pub fn is_initialized(self) -> bool {
        self.0 == Status::Initialized as u8
    }
}

/// SensorReading is a single reading from the DHT20 sensor.
///
/// This is returned from the `read_data` method. You get:
/// * humidity in % Relative Humidity
/// * temperature in degrees Celsius.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "use-defmt", derive(Format))]
pub struct SensorReading {
    pub humidity: f32,
    pub temperature: f32,
}

impl SensorReading {
    /// Create a SensorReading from the 5 data bytes between the status
    /// byte and the CRC of a sensor frame.
    ///
    /// This is done by the `read_data` method.
    fn from_bytes(sensor_data: [u8; 5]) -> Self {
        // The five bytes carry 20 bits of humidity followed by 20 bits of
        // temperature, with byte 2 split down the middle between the two.
        let split_byte = sensor_data[2];

        // Humidity takes bytes 0 and 1 and the high nibble of the split
        // byte. The first byte lands on bits 19..12, the second on bits
        // 11..4, and the nibble fills the last four.
        let high_bits_humidity = (sensor_data[0] as u32) << 12;
        let middle_bits_humidity = (sensor_data[1] as u32) << 4;
        let low_bits_humidity = (split_byte >> 4) as u32;
        let humidity_val = high_bits_humidity | middle_bits_humidity | low_bits_humidity;

        // Temperature starts in the low nibble of the split byte, which
        // forms bits 19..16, followed by bytes 3 and 4.
        let high_bits_temperature = ((split_byte & 0b0000_1111) as u32) << 16;
        let middle_bits_temperature = (sensor_data[3] as u32) << 8;
        let low_bits_temperature = sensor_data[4] as u32;
        let temperature_val =
            high_bits_temperature | middle_bits_temperature | low_bits_temperature;

        // Sections 8.1 and 8.2 of the datasheet: scale the 20-bit raw
        // values into percent relative humidity and degrees Celsius.
        let humidity_percent = (humidity_val as f32) / ((1 << 20) as f32) * 100.0;
        let temperature_celsius = (temperature_val as f32) / ((1 << 20) as f32) * 200.0 - 50.0;

        SensorReading {
            humidity: humidity_percent,
            temperature: temperature_celsius,
        }
    }
}

/// Retry limits for the driver's two wait loops.
///
/// The sensor gives no upper bound for how long the register reset
/// sequence or a stuck conversion may take, so both loops are bounded by
/// attempt counts. A calibration pass costs three register sequences of
/// three 5ms waits each plus a status transaction, so the default of 10
/// passes gives up after roughly half a second. Measurement polls run
/// every 10ms after the fixed 80ms conversion wait, so the default of 100
/// polls gives up about a second after the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(Format))]
pub struct Config {
    /// Full passes over the calibration registers before construction
    /// fails with `Error::CalibrationTimeout`.
    pub max_calibration_passes: u32,
    /// Status polls after the conversion wait before `read_data` fails
    /// with `Error::MeasurementTimeout`.
    pub max_measure_polls: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_calibration_passes: 10,
            max_measure_polls: 100,
        }
    }
}

/// Driver errors.
#[derive(Debug, PartialEq)]
#[cfg_attr(feature = "use-defmt", derive(Format))]
pub enum Error<E> {
    /// I2C bus error
    I2c(E),
    /// CRC validation failed
    InvalidCrc,
    /// The status word still did not read 0x18 after the configured
    /// number of register reset passes.
    CalibrationTimeout,
    /// The sensor still reported busy after the configured number of
    /// status polls.
    MeasurementTimeout,
}

/// A DHT20 sensor on the I2C bus `I`.
///
/// The address of the sensor will be `SENSOR_ADDRESS` from this crate,
/// unless there is some kind of special address-translating hardware in
/// use. Construction runs the register reset sequence, so a driver you
/// hold is always ready to measure.
pub struct DHT20<I>
where
    I: I2c,
{
    i2c: I,
    address: u8,
    config: Config,
}

impl<E, I> DHT20<I>
where
    I: I2c<Error = E>,
{
    /// Create a DHT20 driver and bring the sensor to its measuring state.
    ///
    /// This consumes the I2C bus `I`. The address will almost always be
    /// `SENSOR_ADDRESS` from this crate. The sensor is given its 100ms
    /// power-up settling time and then taken through the register reset
    /// sequence until the status word reads 0x18, so this takes at least
    /// 100ms to return. Bus failures and a sensor that never reaches the
    /// expected status word are both reported as errors; there is no
    /// driver to hold in either case.
    pub fn new(i2c: I, address: u8, delay: &mut impl DelayNs) -> Result<Self, Error<E>> {
        Self::with_config(i2c, address, Config::default(), delay)
    }

    /// Create a DHT20 driver with explicit retry limits.
    ///
    /// Works like `new`; see `Config` for what the limits bound.
    pub fn with_config(
        i2c: I,
        address: u8,
        config: Config,
        delay: &mut impl DelayNs,
    ) -> Result<Self, Error<E>> {
        let mut dht20 = DHT20 {
            i2c,
            address,
            config,
        };

        // The sensor accepts no commands for the first 100ms after
        // power-on (datasheet section 7.4).
        delay.delay_ms(100);
        dht20.reset_sensor(delay)?;

        Ok(dht20)
    }

    /// Ask the sensor to report its status word.
    ///
    /// The command byte is written and the single status byte read back in
    /// one combined bus transaction. The returned `SensorStatus` tells you
    /// whether the sensor is busy measuring, whether it reports itself
    /// calibrated, and whether the calibration registers hold their reset
    /// values.
    pub fn read_status(&mut self) -> Result<SensorStatus, Error<E>> {
        let command: [u8; 1] = [Command::CheckStatus as u8];
        let mut read_buffer = [0u8; 1];

        self.i2c
            .write_read(self.address, &command, &mut read_buffer)
            .map_err(Error::I2c)?;

        Ok(SensorStatus::new(read_buffer[0]))
    }

    /// Check the sensor's calibration bits.
    ///
    /// One status transaction, then the mask check from
    /// `SensorStatus::is_calibrated`. Construction has already verified
    /// this, but the check stays useful as a health probe between
    /// measurements.
    pub fn is_calibrated(&mut self) -> Result<bool, Error<E>> {
        Ok(self.read_status()?.is_calibrated())
    }

    /// Measure temperature and humidity.
    ///
    /// This takes at least 80ms to complete: the conversion time is
    /// fixed, and the sensor is polled every 10ms after that until it
    /// drops the busy flag. The 7-byte result frame is CRC-checked before
    /// it is decoded; a frame that fails the check never turns into a
    /// reading.
    pub fn read_data(&mut self, delay: &mut impl DelayNs) -> Result<SensorReading, Error<E>> {
        self.send_trigger_measurement()?;
        // The conversion takes 80ms (datasheet section 7.4).
        delay.delay_ms(80);

        let mut polls = 0;
        let mut status = self.poll_status()?;
        while !status.is_ready() {
            if polls >= self.config.max_measure_polls {
                return Err(Error::MeasurementTimeout);
            }
            polls += 1;
            // Give the conversion time to finish. On hosted targets the
            // sleep also hands the thread back to the scheduler.
            delay.delay_ms(10);
            status = self.poll_status()?;
        }

        // 1 byte status, 20 bits humidity + 20 bits temperature, 1 byte CRC.
        let mut read_buffer = [0u8; 7];
        self.i2c
            .read(self.address, &mut read_buffer)
            .map_err(Error::I2c)?;

        let data: &[u8] = &read_buffer[..6];
        let crc_byte: u8 = read_buffer[6];

        let crc = compute_crc(data);
        if crc_byte != crc {
            return Err(Error::InvalidCrc);
        }

        // Byte 0 repeats the status word and byte 6 is the CRC we just
        // checked; the five bytes between them carry the packed readings.
        Ok(SensorReading::from_bytes([
            read_buffer[1],
            read_buffer[2],
            read_buffer[3],
            read_buffer[4],
            read_buffer[5],
        ]))
    }

    /// Send the Soft Reset command and bring the sensor back to its
    /// measuring state.
    ///
    /// The reset itself finishes within 20ms. The register reset sequence
    /// runs again afterwards, so a successful return means the sensor is
    /// calibrated and ready, the same guarantee construction gives.
    pub fn soft_reset(&mut self, delay: &mut impl DelayNs) -> Result<(), Error<E>> {
        let command: [u8; 1] = [Command::SoftReset as u8];

        self.i2c.write(self.address, &command).map_err(Error::I2c)?;
        delay.delay_ms(20);

        self.reset_sensor(delay)
    }

    /// Destroy this driver and release the I2C bus `I`.
    pub fn destroy(self) -> I {
        self.i2c
    }

    /// Run the register reset sequence until the status word reads 0x18.
    ///
    /// The whole status word is compared, not the calibration mask. A
    /// sensor can report itself calibrated while a register still needs
    /// its rewrite; only the exact word says the sequence is done. Passes
    /// over the three registers repeat up to the configured limit, with
    /// the status word re-read after each full pass.
    fn reset_sensor(&mut self, delay: &mut impl DelayNs) -> Result<(), Error<E>> {
        let mut passes = 0;
        let mut status = self.read_status()?;

        while !status.is_initialized() {
            if passes >= self.config.max_calibration_passes {
                return Err(Error::CalibrationTimeout);
            }
            passes += 1;

            for register in CALIBRATION_REGISTERS {
                // A refused rewrite is not fatal here. The status word
                // re-read below decides whether another pass runs.
                self.reset_register(register, delay)?;
            }
            status = self.read_status()?;
        }

        Ok(())
    }

    /// Run the reset sequence for one calibration register.
    ///
    /// The register is cleared with a three-byte write, read back after
    /// 5ms, and rewritten through the matching 0xB0-prefixed command with
    /// the two trailing bytes the sensor just returned. A bus error on
    /// the final rewrite is reported as `Ok(false)`; errors on the
    /// initial write or the read-back propagate.
    fn reset_register(
        &mut self,
        register: u8,
        delay: &mut impl DelayNs,
    ) -> Result<bool, Error<E>> {
        let command: [u8; 3] = [register, 0x00, 0x00];
        self.i2c.write(self.address, &command).map_err(Error::I2c)?;
        delay.delay_ms(5);

        let mut read_buffer = [0u8; 3];
        self.i2c
            .read(self.address, &mut read_buffer)
            .map_err(Error::I2c)?;
        delay.delay_ms(5);

        // 0xB0 | register addresses the rewrite command for this
        // register. Byte 0 of the read-back is the status word and is not
        // sent back.
        let command: [u8; 3] = [0xB0 | register, read_buffer[1], read_buffer[2]];
        if self.i2c.write(self.address, &command).is_err() {
            return Ok(false);
        }
        delay.delay_ms(5);

        Ok(true)
    }

    /// Send the "Trigger Measurement" command to the sensor.
    ///
    /// This does not return anything, it only instructs the sensor to get
    /// the data ready. After sending this command, you need to wait 80ms
    /// before attempting to read data back. See `read_data` and the
    /// flowchart at the top of this file.
    fn send_trigger_measurement(&mut self) -> Result<(), Error<E>> {
        // TriggerMeasurement is 0b1010_1100, equivalent to 0xAC.
        // This command takes two bytes of parameter: 0b0011_0011 (0x33),
        // then 0b0000_0000 (0x00). There is no indication what these
        // parameters mean, just that they should be provided. There is no
        // returned value.
        let command: [u8; 3] = [
            Command::TriggerMeasurement as u8,
            0b0011_0011, // 0x33
            0b0000_0000, // 0x00
        ];

        self.i2c.write(self.address, &command).map_err(Error::I2c)?;

        Ok(())
    }

    /// Read the status word with a bare read.
    ///
    /// While a measurement cycle is running the sensor reports its status
    /// as the first byte of any read, so no command byte is written
    /// first. `read_data` uses this between the conversion wait and the
    /// payload read; `read_status` is the command-based variant.
    fn poll_status(&mut self) -> Result<SensorStatus, Error<E>> {
        let mut read_buffer = [0u8; 1];

        self.i2c
            .read(self.address, &mut read_buffer)
            .map_err(Error::I2c)?;

        Ok(SensorStatus::new(read_buffer[0]))
    }
}

/// compute_crc uses the CRCu8 algorithm from crc-any, configured as the
/// CRC-8 variant the DHT20 protects its payload with.
///
/// The datasheet gives the parameters: initial value 0xFF and polynomial
/// CRC[7:0] = 1 + x**4 + x**5 + x**8. Dropping the leading x**8 term, the
/// remaining bits give the hex representation 0x31. There is no
/// reflection on input or output and no final XOR. The same parameters
/// are used across the whole AHT20 die family, so reference vectors from
/// any of those datasheets apply here too.
fn compute_crc(bytes: &[u8]) -> u8 {
    // Poly (0x31), bits (8), initial (0xff), final_xor (0x00), reflect (false).
    let mut crc = CRCu8::create_crc(0x31, 8, 0xff, 0x00, false);
    crc.digest(bytes);
    crc.get_crc()
}
