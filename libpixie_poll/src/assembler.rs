use std::sync::atomic::{AtomicBool, Ordering};

use super::constants::{Word, EXTERNAL_FIFO_LENGTH, MIN_FIFO_READ, POLL_TRIES, WORD_SIZE};
use super::error::{AssemblerError, EventParseError};
use super::event::EventHeader;
use super::hardware::HardwareGateway;
use super::stats::StatsAggregator;

/// Drains every module's FIFO into framed spills.
///
/// One call to [SpillAssembler::drain_once] is one pass: wait for a FIFO to
/// cross the drain threshold, read every module out, walk the event headers
/// to find the spill's event boundaries, and carry any event that straddles
/// the read over to the next pass. The assembler owns the scratch buffer the
/// spill is framed in and the per-module partial-event buffers; nothing else
/// touches them.
///
/// Spill layout: per module, ascending, `[length, module, words...]` where
/// `length` counts itself and the module word. A module with nothing to
/// contribute is present as `[2, module]`.
pub struct SpillAssembler {
    thresh_words: u32,
    scratch: Vec<Word>,
    partials: Vec<Vec<Word>>,
    pub quiet: bool,
    pub debug: bool,
}

impl SpillAssembler {
    pub fn new(thresh_words: u32) -> Self {
        SpillAssembler {
            thresh_words,
            scratch: Vec::new(),
            partials: Vec::new(),
            quiet: false,
            debug: false,
        }
    }

    /// Words currently saved for a module from a straddling event.
    pub fn partial_words(&self, module: usize) -> &[Word] {
        self.partials
            .get(module)
            .map(|p| p.as_slice())
            .unwrap_or(&[])
    }

    /// Perform one drain pass.
    ///
    /// Returns `Ok(None)` when no FIFO crossed the threshold and nothing
    /// forced a spill, `Ok(Some(spill))` with the framed spill otherwise.
    /// Any hardware fault or corrupted stream aborts the pass with an error;
    /// the caller decides the fate of the run.
    pub fn drain_once<G: HardwareGateway>(
        &mut self,
        gateway: &mut G,
        stats: &mut StatsAggregator,
        stop_requested: &AtomicBool,
        force_spill: bool,
    ) -> Result<Option<&[Word]>, AssemblerError> {
        let n_cards = gateway.num_modules();
        if self.partials.len() != n_cards {
            self.partials.resize(n_cards, Vec::new());
        }

        // Wait until some module crosses the threshold, an operator asks to
        // stop, or the patience runs out.
        let mut n_words = vec![0u32; n_cards];
        for _timeout in 0..POLL_TRIES {
            for (module, depth) in n_words.iter_mut().enumerate() {
                *depth = gateway.fifo_depth(module);
            }
            let max_words = n_words.iter().max().copied().unwrap_or(0);
            if max_words > self.thresh_words || stop_requested.load(Ordering::Relaxed) {
                break;
            }
        }

        let max_words = n_words.iter().max().copied().unwrap_or(0);
        let read_data =
            max_words > self.thresh_words || stop_requested.load(Ordering::Relaxed);
        if !read_data && !force_spill {
            return Ok(None);
        }

        self.scratch.clear();
        for module in 0..n_cards {
            let depth = n_words[module] as usize;

            if depth < MIN_FIFO_READ {
                if force_spill && !self.partials[module].is_empty() {
                    // Final flush: a stranded partial event must not be
                    // lost, emit it as-is together with whatever is left.
                    self.flush_stranded_partial(gateway, module, depth)?;
                } else {
                    self.scratch.push(2);
                    self.scratch.push(module as Word);
                }
                continue;
            }

            if depth >= EXTERNAL_FIFO_LENGTH {
                spdlog::error!(
                    "Full FIFO in module {} size: {}/{}, aborting",
                    module,
                    depth,
                    EXTERNAL_FIFO_LENGTH
                );
                return Err(AssemblerError::FullFifo {
                    module,
                    depth: depth as u32,
                });
            }

            // Two injected words describe the segment: its length and the
            // module index. The length is patched in once it is known.
            let length_slot = self.scratch.len();
            self.scratch.push(0);
            self.scratch.push(module as Word);
            let segment_start = self.scratch.len();

            // Re-inject the partial event saved from the previous drain.
            self.scratch.extend_from_slice(&self.partials[module]);

            let read_at = self.scratch.len();
            self.scratch.resize(read_at + depth, 0);
            gateway.read_fifo(module, &mut self.scratch[read_at..])?;

            if !self.quiet {
                spdlog::info!(
                    "Read {} words from module {} and re-injected {} partial event words",
                    depth,
                    module,
                    self.partials[module].len()
                );
            }

            let mut segment_words = depth + self.partials[module].len();
            self.partials[module].clear();

            // Walk the event headers to find the spill's event boundaries.
            let segment_end = segment_start + segment_words;
            let expected_slot = gateway.slot_of(module);
            let mut cursor = segment_start;
            let mut event_size = 0usize;
            while cursor < segment_end {
                let header = EventHeader::decode(self.scratch[cursor]);
                if header.slot != expected_slot {
                    return Err(self.corrupt_data(
                        module,
                        segment_start,
                        cursor,
                        EventParseError::SlotMismatch {
                            module,
                            read: header.slot,
                            expected: expected_slot,
                        },
                    ));
                }
                if header.size == 0 {
                    return Err(self.corrupt_data(
                        module,
                        segment_start,
                        cursor,
                        EventParseError::ZeroEventSize(module),
                    ));
                }

                event_size = header.size as usize;
                // Only events whose words are all present count; a
                // straddling event is accounted for in the drain that
                // completes it.
                if cursor + event_size <= segment_end && !header.virtual_channel {
                    stats.add_event(
                        module,
                        header.channel as usize,
                        (event_size * WORD_SIZE) as u64,
                    );
                }
                cursor += event_size;
            }

            if cursor > segment_end {
                // The last event promised more words than the FIFO held.
                // Save what is present and hand it to the next drain.
                let missing = cursor - segment_end;
                let partial_size = event_size - missing;
                if self.debug {
                    spdlog::debug!(
                        "Partial event {}/{} words in module {}",
                        partial_size,
                        event_size,
                        module
                    );
                }
                let event_start = cursor - event_size;
                self.partials[module]
                    .extend_from_slice(&self.scratch[event_start..event_start + partial_size]);
                segment_words -= partial_size;
                self.scratch.truncate(segment_start + segment_words);
            }

            self.scratch[length_slot] = segment_words as Word + 2;
        }

        Ok(Some(&self.scratch))
    }

    /// Emit a module's saved partial plus any sub-floor FIFO remainder as a
    /// segment of its own, without parsing. Used only on a forced spill.
    fn flush_stranded_partial<G: HardwareGateway>(
        &mut self,
        gateway: &mut G,
        module: usize,
        depth: usize,
    ) -> Result<(), AssemblerError> {
        let length_slot = self.scratch.len();
        self.scratch.push(0);
        self.scratch.push(module as Word);
        self.scratch.extend_from_slice(&self.partials[module]);
        let read_at = self.scratch.len();
        if depth > 0 {
            self.scratch.resize(read_at + depth, 0);
            gateway.read_fifo(module, &mut self.scratch[read_at..])?;
        }
        let segment_words = self.partials[module].len() + depth;
        self.partials[module].clear();
        self.scratch[length_slot] = segment_words as Word + 2;
        if !self.quiet {
            spdlog::info!(
                "Flushed {} stranded partial event words from module {}",
                segment_words,
                module
            );
        }
        Ok(())
    }

    /// Log a corrupted segment, dump its head, and build the error.
    fn corrupt_data(
        &self,
        module: usize,
        segment_start: usize,
        cursor: usize,
        source: EventParseError,
    ) -> AssemblerError {
        let words_in = cursor - segment_start;
        spdlog::error!(
            "Parsing indicated corrupted data {} words into the FIFO of module {}",
            words_in,
            module
        );
        if !self.quiet {
            let end = (segment_start + 100).min(self.scratch.len());
            let mut dump = String::new();
            for (i, word) in self.scratch[segment_start..end].iter().enumerate() {
                if i % 10 == 0 {
                    dump.push_str("\n\t");
                }
                dump.push_str(&format!("{word:08x} "));
            }
            spdlog::error!("First words of the offending segment:{}", dump);
        }
        AssemblerError::CorruptData {
            module,
            words_in,
            source,
        }
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::BootMode;
    use crate::mock::MockCrate;

    const SLOTS: [u8; 2] = [2, 3];

    fn booted_crate(slots: &[u8]) -> MockCrate {
        let mut pif = MockCrate::new(slots.to_vec());
        pif.discover_slots().unwrap();
        pif.init().unwrap();
        pif.boot(BootMode::Full).unwrap();
        pif
    }

    /// One event: a header word followed by size - 1 filler words.
    fn make_event(slot: u8, channel: u8, size: u32) -> Vec<Word> {
        let header = EventHeader {
            channel,
            slot,
            size,
            virtual_channel: false,
        };
        let mut words = vec![header.encode()];
        words.extend((1..size).map(|i| 0xBEEF_0000 | i));
        words
    }

    /// Split a spill back into (module, words) segments.
    fn parse_segments(spill: &[Word]) -> Vec<(Word, Vec<Word>)> {
        let mut segments = Vec::new();
        let mut at = 0;
        while at < spill.len() {
            let length = spill[at] as usize;
            assert!(length >= 2);
            segments.push((spill[at + 1], spill[at + 2..at + length].to_vec()));
            at += length;
        }
        assert_eq!(at, spill.len());
        segments
    }

    fn unforced_stop() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn test_two_modules_no_partials() {
        let mut pif = booted_crate(&SLOTS);
        let mut fifo0 = make_event(2, 0, 100);
        fifo0.extend(make_event(2, 1, 100));
        let mut fifo1 = make_event(3, 5, 150);
        fifo1.extend(make_event(3, 6, 150));
        pif.load_fifo(0, &fifo0);
        pif.load_fifo(1, &fifo1);

        let mut asm = SpillAssembler::new(10);
        asm.quiet = true;
        let mut stats = StatsAggregator::new();
        let stop = unforced_stop();
        let spill = asm
            .drain_once(&mut pif, &mut stats, &stop, false)
            .unwrap()
            .unwrap()
            .to_vec();

        assert_eq!(spill.len(), 504);
        assert_eq!(spill[0], 202);
        assert_eq!(spill[1], 0);
        assert_eq!(spill[202], 302);
        assert_eq!(spill[203], 1);
        let segments = parse_segments(&spill);
        assert_eq!(segments[0].1, fifo0);
        assert_eq!(segments[1].1, fifo1);
        assert_eq!(stats.total_events(), 4);
    }

    #[test]
    fn test_below_threshold_is_idle() {
        let mut pif = booted_crate(&SLOTS);
        pif.load_fifo(0, &make_event(2, 0, 50));
        let mut asm = SpillAssembler::new(1000);
        asm.quiet = true;
        let mut stats = StatsAggregator::new();
        let stop = unforced_stop();
        let spill = asm.drain_once(&mut pif, &mut stats, &stop, false).unwrap();
        assert!(spill.is_none());
        // the words are still in the FIFO for the next pass
        assert_eq!(pif.fifo_depth(0), 50);
    }

    #[test]
    fn test_empty_forced_spill_covers_every_module() {
        let mut pif = booted_crate(&SLOTS);
        let mut asm = SpillAssembler::new(10);
        asm.quiet = true;
        let mut stats = StatsAggregator::new();
        let stop = unforced_stop();
        let spill = asm
            .drain_once(&mut pif, &mut stats, &stop, true)
            .unwrap()
            .unwrap();
        assert_eq!(spill, &[2, 0, 2, 1]);
    }

    #[test]
    fn test_stop_request_drains_below_threshold() {
        let mut pif = booted_crate(&SLOTS);
        pif.load_fifo(0, &make_event(2, 0, 50));
        let mut asm = SpillAssembler::new(1000);
        asm.quiet = true;
        let mut stats = StatsAggregator::new();
        let stop = AtomicBool::new(true);
        let spill = asm
            .drain_once(&mut pif, &mut stats, &stop, false)
            .unwrap()
            .unwrap();
        let segments = parse_segments(spill);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].1.len(), 50);
    }

    #[test]
    fn test_straddle_saves_partial_words() {
        let mut pif = booted_crate(&SLOTS);
        // 240 words of complete events, then 10 words of an event that
        // promises 60
        let mut fifo0 = Vec::new();
        for _ in 0..4 {
            fifo0.extend(make_event(2, 2, 60));
        }
        let hanging = make_event(2, 3, 60);
        fifo0.extend_from_slice(&hanging[..10]);
        pif.load_fifo(0, &fifo0);

        let mut asm = SpillAssembler::new(10);
        asm.quiet = true;
        let mut stats = StatsAggregator::new();
        let stop = unforced_stop();
        let spill = asm
            .drain_once(&mut pif, &mut stats, &stop, false)
            .unwrap()
            .unwrap()
            .to_vec();

        let segments = parse_segments(&spill);
        assert_eq!(segments[0].1.len(), 240);
        assert_eq!(spill[0], 242);
        assert_eq!(asm.partial_words(0), &hanging[..10]);
        // the incomplete event is not counted yet
        assert_eq!(stats.total_events(), 4);
    }

    #[test]
    fn test_partial_reinjected_at_head_of_next_drain() {
        let mut pif = booted_crate(&SLOTS);
        let event = make_event(2, 3, 60);
        pif.load_fifo(0, &{
            let mut words = make_event(2, 2, 240);
            words.extend_from_slice(&event[..10]);
            words
        });

        let mut asm = SpillAssembler::new(10);
        asm.quiet = true;
        let mut stats = StatsAggregator::new();
        let stop = unforced_stop();
        asm.drain_once(&mut pif, &mut stats, &stop, false)
            .unwrap()
            .unwrap();
        assert_eq!(asm.partial_words(0), &event[..10]);

        // the rest of the event arrives
        pif.load_fifo(0, &event[10..]);
        let spill = asm
            .drain_once(&mut pif, &mut stats, &stop, true)
            .unwrap()
            .unwrap()
            .to_vec();
        let segments = parse_segments(&spill);
        assert_eq!(segments[0].1, event);
        assert!(asm.partial_words(0).is_empty());
        assert_eq!(stats.total_events(), 2);
    }

    #[test]
    fn test_forced_spill_flushes_stranded_partial() {
        let mut pif = booted_crate(&SLOTS);
        let event = make_event(2, 3, 60);
        pif.load_fifo(0, &{
            let mut words = make_event(2, 2, 240);
            words.extend_from_slice(&event[..10]);
            words
        });

        let mut asm = SpillAssembler::new(10);
        asm.quiet = true;
        let mut stats = StatsAggregator::new();
        let stop = unforced_stop();
        asm.drain_once(&mut pif, &mut stats, &stop, false)
            .unwrap()
            .unwrap();

        // nothing new arrived; a forced spill must still emit the partial
        let spill = asm
            .drain_once(&mut pif, &mut stats, &stop, true)
            .unwrap()
            .unwrap()
            .to_vec();
        assert_eq!(spill[0], 12);
        assert_eq!(spill[1], 0);
        assert_eq!(&spill[2..12], &event[..10]);
        assert_eq!(&spill[12..], &[2, 1]);
        assert!(asm.partial_words(0).is_empty());
    }

    #[test]
    fn test_full_fifo_aborts() {
        let mut pif = booted_crate(&SLOTS);
        pif.load_fifo(1, &vec![0u32; EXTERNAL_FIFO_LENGTH]);
        let mut asm = SpillAssembler::new(10);
        asm.quiet = true;
        let mut stats = StatsAggregator::new();
        let stop = unforced_stop();
        let result = asm.drain_once(&mut pif, &mut stats, &stop, false);
        assert!(matches!(
            result,
            Err(AssemblerError::FullFifo { module: 1, .. })
        ));
    }

    #[test]
    fn test_read_failure_aborts() {
        let mut pif = booted_crate(&SLOTS);
        pif.load_fifo(0, &make_event(2, 0, 50));
        pif.fail_next_read(0);
        let mut asm = SpillAssembler::new(10);
        asm.quiet = true;
        let mut stats = StatsAggregator::new();
        let stop = unforced_stop();
        let result = asm.drain_once(&mut pif, &mut stats, &stop, false);
        assert!(matches!(result, Err(AssemblerError::ReadError(_))));
    }

    #[test]
    fn test_slot_mismatch_is_corruption() {
        let mut pif = booted_crate(&SLOTS);
        // module 0 declares slot 2 but the event claims slot 9
        pif.load_fifo(0, &make_event(9, 0, 50));
        let mut asm = SpillAssembler::new(10);
        asm.quiet = true;
        let mut stats = StatsAggregator::new();
        let stop = unforced_stop();
        let result = asm.drain_once(&mut pif, &mut stats, &stop, false);
        assert!(matches!(
            result,
            Err(AssemblerError::CorruptData {
                module: 0,
                source: EventParseError::SlotMismatch { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_zero_event_size_is_corruption() {
        let mut pif = booted_crate(&SLOTS);
        let mut words = make_event(2, 0, 20);
        // a header with a zero size field 20 words in
        words.push(
            EventHeader {
                channel: 0,
                slot: 2,
                size: 0,
                virtual_channel: false,
            }
            .encode(),
        );
        words.extend(vec![0u32; 30]);
        pif.load_fifo(0, &words);
        let mut asm = SpillAssembler::new(10);
        asm.quiet = true;
        let mut stats = StatsAggregator::new();
        let stop = unforced_stop();
        let result = asm.drain_once(&mut pif, &mut stats, &stop, false);
        match result {
            Err(AssemblerError::CorruptData {
                module, words_in, ..
            }) => {
                assert_eq!(module, 0);
                assert_eq!(words_in, 20);
            }
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn test_virtual_events_excluded_from_stats() {
        let mut pif = booted_crate(&SLOTS);
        // virtual flag doubles as size bit 12, so the size must carry it
        let virtual_event = EventHeader {
            channel: 4,
            slot: 2,
            size: 0x1000 + 20,
            virtual_channel: true,
        };
        let mut words = vec![virtual_event.encode()];
        words.extend(vec![0u32; 0x1000 + 19]);
        words.extend(make_event(2, 5, 30));
        pif.load_fifo(0, &words);

        let mut asm = SpillAssembler::new(10);
        asm.quiet = true;
        let mut stats = StatsAggregator::new();
        let stop = unforced_stop();
        let spill = asm
            .drain_once(&mut pif, &mut stats, &stop, false)
            .unwrap()
            .unwrap();
        // the virtual event is stored in the spill unchanged
        let segments = parse_segments(spill);
        assert_eq!(segments[0].1.len(), words.len());
        // but only the physical event is counted
        assert_eq!(stats.total_events(), 1);
        assert_eq!(stats.events(0, 5), 1);
        assert_eq!(stats.events(0, 4), 0);
    }

    #[test]
    fn test_segments_ascend_module_order() {
        let slots = [2, 3, 4];
        let mut pif = booted_crate(&slots);
        pif.load_fifo(2, &make_event(4, 0, 40));
        pif.load_fifo(0, &make_event(2, 0, 40));
        let mut asm = SpillAssembler::new(10);
        asm.quiet = true;
        let mut stats = StatsAggregator::new();
        let stop = unforced_stop();
        let spill = asm
            .drain_once(&mut pif, &mut stats, &stop, false)
            .unwrap()
            .unwrap();
        let segments = parse_segments(spill);
        let order: Vec<Word> = segments.iter().map(|(module, _)| *module).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert!(segments[1].1.is_empty());
    }
}
