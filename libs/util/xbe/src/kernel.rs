// This file is part of OpenXBE.
//
// OpenXBE is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// OpenXBE is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with OpenXBE.  If not, see <http://www.gnu.org/licenses/>.

//! The kernel export ordinal table. Import thunks name kernel routines by
//! ordinal only; this table restores the names.

use lazy_static::lazy_static;
use std::collections::HashMap;

pub fn kernel_export_name(ordinal: u32) -> Option<&'static str> {
    KERNEL_EXPORTS.get(&ordinal).copied()
}

#[cfg_attr(rustfmt, rustfmt_skip)]
const KERNEL_EXPORT_TABLE: &[(u32, &str)] = &[
    (1, "AvGetSavedDataAddress"),
    (2, "AvSendTVEncoderOption"),
    (3, "AvSetDisplayMode"),
    (4, "AvSetSavedDataAddress"),
    (5, "DbgBreakPoint"),
    (6, "DbgBreakPointWithStatus"),
    (7, "DbgLoadImageSymbols"),
    (8, "DbgPrint"),
    (9, "HalReadSMCTrayState"),
    (10, "DbgPrompt"),
    (11, "DbgUnLoadImageSymbols"),
    (12, "ExAcquireReadWriteLockExclusive"),
    (13, "ExAcquireReadWriteLockShared"),
    (14, "ExAllocatePool"),
    (15, "ExAllocatePoolWithTag"),
    (16, "ExEventObjectType"),
    (17, "ExFreePool"),
    (18, "ExInitializeReadWriteLock"),
    (19, "ExInterlockedAddLargeInteger"),
    (20, "ExInterlockedAddLargeStatistic"),
    (21, "ExInterlockedCompareExchange64"),
    (22, "ExMutantObjectType"),
    (23, "ExQueryPoolBlockSize"),
    (24, "ExQueryNonVolatileSetting"),
    (25, "ExReadWriteRefurbInfo"),
    (26, "ExRaiseException"),
    (27, "ExRaiseStatus"),
    (28, "ExReleaseReadWriteLock"),
    (29, "ExSaveNonVolatileSetting"),
    (30, "ExSemaphoreObjectType"),
    (31, "ExTimerObjectType"),
    (32, "ExfInterlockedInsertHeadList"),
    (33, "ExfInterlockedInsertTailList"),
    (34, "ExfInterlockedRemoveHeadList"),
    (35, "FscGetCacheSize"),
    (36, "FscInvalidateIdleBlocks"),
    (37, "FscSetCacheSize"),
    (38, "HalClearSoftwareInterrupt"),
    (39, "HalDisableSystemInterrupt"),
    (40, "HalDiskCachePartitionCount"),
    (41, "HalDiskModelNumber"),
    (42, "HalDiskSerialNumber"),
    (43, "HalEnableSystemInterrupt"),
    (44, "HalGetInterruptVector"),
    (45, "HalReadSMBusValue"),
    (46, "HalReadWritePCISpace"),
    (47, "HalRegisterShutdownNotification"),
    (48, "HalRequestSoftwareInterrupt"),
    (49, "HalReturnToFirmware"),
    (50, "HalWriteSMBusValue"),
    (51, "InterlockedCompareExchange"),
    (52, "InterlockedDecrement"),
    (53, "InterlockedIncrement"),
    (54, "InterlockedExchange"),
    (55, "InterlockedExchangeAdd"),
    (56, "InterlockedFlushSList"),
    (57, "InterlockedPopEntrySList"),
    (58, "InterlockedPushEntrySList"),
    (59, "IoAllocateIrp"),
    (60, "IoBuildAsynchronousFsdRequest"),
    (61, "IoBuildDeviceIoControlRequest"),
    (62, "IoBuildSynchronousFsdRequest"),
    (63, "IoCheckShareAccess"),
    (64, "IoCompletionObjectType"),
    (65, "IoCreateDevice"),
    (66, "IoCreateFile"),
    (67, "IoCreateSymbolicLink"),
    (68, "IoDeleteDevice"),
    (69, "IoDeleteSymbolicLink"),
    (70, "IoDismountVolume"),
    (71, "IoDismountVolumeByName"),
    (72, "IoFreeIrp"),
    (73, "IoInitializeIrp"),
    (74, "IoInvalidDeviceRequest"),
    (75, "IoQueryFileInformation"),
    (76, "IoQueryVolumeInformation"),
    (77, "IoQueueThreadIrp"),
    (78, "IoRemoveShareAccess"),
    (79, "IoSetIoCompletion"),
    (80, "IoSetShareAccess"),
    (81, "IoStartNextPacket"),
    (82, "IoStartNextPacketByKey"),
    (83, "IoStartPacket"),
    (84, "IoSynchronousDeviceIoControlRequest"),
    (85, "IoSynchronousFsdRequest"),
    (86, "IofCallDriver"),
    (87, "IofCompleteRequest"),
    (88, "KdDebuggerEnabled"),
    (89, "KdDebuggerNotPresent"),
    (91, "KeAlertResumeThread"),
    (92, "KeAlertThread"),
    (93, "KeBoostPriorityThread"),
    (94, "KeBugCheck"),
    (95, "KeBugCheckEx"),
    (96, "KeCancelTimer"),
    (97, "KeConnectInterrupt"),
    (98, "KeDelayExecutionThread"),
    (99, "KeDisconnectInterrupt"),
    (100, "KeEnterCriticalRegion"),
    (101, "MmGlobalData"),
    (102, "KeGetCurrentIrql"),
    (103, "KeGetCurrentThread"),
    (104, "KeInitializeApc"),
    (105, "KeInitializeDeviceQueue"),
    (106, "KeInitializeDpc"),
    (107, "KeInitializeEvent"),
    (108, "KeInitializeInterrupt"),
    (109, "KeInitializeMutant"),
    (110, "KeInitializeQueue"),
    (111, "KeInitializeSemaphore"),
    (112, "KeInitializeTimerEx"),
    (113, "KeInsertByKeyDeviceQueue"),
    (114, "KeInsertDeviceQueue"),
    (115, "KeInsertHeadQueue"),
    (116, "KeInsertQueue"),
    (117, "KeInsertQueueApc"),
    (118, "KeInsertQueueDpc"),
    (119, "KeInterruptTime"),
    (120, "KeIsExecutingDpc"),
    (121, "KeLeaveCriticalRegion"),
    (122, "KePulseEvent"),
    (123, "KeQueryBasePriorityThread"),
    (124, "KeQueryInterruptTime"),
    (125, "KeQueryPerformanceCounter"),
    (126, "KeQueryPerformanceFrequency"),
    (127, "KeQuerySystemTime"),
    (128, "KeRaiseIrqlToDpcLevel"),
    (129, "KeRaiseIrqlToSynchLevel"),
    (130, "KeReleaseMutant"),
    (131, "KeReleaseSemaphore"),
    (132, "KeRemoveByKeyDeviceQueue"),
    (133, "KeRemoveDeviceQueue"),
    (134, "KeRemoveEntryDeviceQueue"),
    (135, "KeRemoveQueue"),
    (136, "KeRemoveQueueDpc"),
    (137, "KeResetEvent"),
    (138, "KeRestoreFloatingPointState"),
    (139, "KeResumeThread"),
    (140, "KeRundownQueue"),
    (141, "KeSaveFloatingPointState"),
    (142, "KeSetBasePriorityThread"),
    (143, "KeSetDisableBoostThread"),
    (144, "KeSetEvent"),
    (145, "KeSetEventBoostPriority"),
    (146, "KeSetPriorityProcess"),
    (147, "KeSetPriorityThread"),
    (148, "KeSetTimer"),
    (149, "KeSetTimerEx"),
    (150, "KeStallExecutionProcessor"),
    (151, "KeSuspendThread"),
    (152, "KeSynchronizeExecution"),
    (153, "KeSystemTime"),
    (154, "KeTestAlertThread"),
    (155, "KeTickCount"),
    (156, "KeTimeIncrement"),
    (157, "KeWaitForMultipleObjects"),
    (158, "KeWaitForSingleObject"),
    (159, "MmAllocateContiguousMemory"),
    (160, "MmAllocateContiguousMemoryEx"),
    (161, "MmAllocateSystemMemory"),
    (162, "MmClaimGpuInstanceMemory"),
    (163, "MmCreateKernelStack"),
    (164, "MmDeleteKernelStack"),
    (165, "MmFreeContiguousMemory"),
    (166, "MmFreeSystemMemory"),
    (167, "MmGetPhysicalAddress"),
    (168, "MmIsAddressValid"),
    (169, "MmLockUnlockBufferPages"),
    (170, "MmLockUnlockPhysicalPage"),
    (171, "MmMapIoSpace"),
    (172, "MmPersistContiguousMemory"),
    (173, "MmQueryAddressProtect"),
    (174, "MmQueryAllocationSize"),
    (175, "MmQueryStatistics"),
    (176, "MmSetAddressProtect"),
    (177, "MmUnmapIoSpace"),
    (178, "NtAllocateVirtualMemory"),
    (179, "NtCancelTimer"),
    (180, "NtClearEvent"),
    (181, "NtClose"),
    (182, "NtCreateDirectoryObject"),
    (183, "NtCreateEvent"),
    (184, "NtCreateFile"),
    (185, "NtCreateIoCompletion"),
    (186, "NtCreateMutant"),
    (187, "NtCreateSemaphore"),
    (188, "NtCreateTimer"),
    (189, "NtDeleteFile"),
    (190, "NtDeviceIoControlFile"),
    (191, "NtDuplicateObject"),
    (192, "NtFlushBuffersFile"),
    (193, "NtFreeVirtualMemory"),
    (194, "NtFsControlFile"),
    (195, "NtOpenDirectoryObject"),
    (196, "NtOpenFile"),
    (197, "NtOpenSymbolicLinkObject"),
    (198, "NtProtectVirtualMemory"),
    (199, "NtPulseEvent"),
    (200, "NtQueueApcThread"),
    (201, "NtQueryDirectoryFile"),
    (202, "NtQueryDirectoryObject"),
    (203, "NtQueryEvent"),
    (204, "NtQueryFullAttributesFile"),
    (205, "NtQueryInformationFile"),
    (206, "NtQueryIoCompletion"),
    (207, "NtQueryMutant"),
    (208, "NtQuerySemaphore"),
    (209, "NtQuerySymbolicLinkObject"),
    (210, "NtQueryTimer"),
    (211, "NtQueryVirtualMemory"),
    (212, "NtQueryVolumeInformationFile"),
    (213, "NtReadFile"),
    (214, "NtReadFileScatter"),
    (215, "NtReleaseMutant"),
    (216, "NtReleaseSemaphore"),
    (217, "NtRemoveIoCompletion"),
    (218, "NtResumeThread"),
    (219, "NtSetEvent"),
    (220, "NtSetInformationFile"),
    (221, "NtSetIoCompletion"),
    (222, "NtSetSystemTime"),
    (223, "NtSetTimerEx"),
    (224, "NtSignalAndWaitForSingleObjectEx"),
    (225, "NtSuspendThread"),
    (226, "NtUserIoApcDispatcher"),
    (227, "NtWaitForSingleObject"),
    (228, "NtWaitForSingleObjectEx"),
    (229, "NtWaitForMultipleObjectsEx"),
    (230, "NtWriteFile"),
    (231, "NtWriteFileGather"),
    (232, "NtYieldExecution"),
    (233, "ObCreateObject"),
    (234, "ObDirectoryObjectType"),
    (235, "ObInsertObject"),
    (236, "ObMakeTemporaryObject"),
    (237, "ObOpenObjectByName"),
    (238, "ObOpenObjectByPointer"),
    (239, "ObpObjectHandleTable"),
    (240, "ObReferenceObjectByHandle"),
    (241, "ObReferenceObjectByName"),
    (242, "ObReferenceObjectByPointer"),
    (243, "ObSymbolicLinkObjectType"),
    (244, "ObfDereferenceObject"),
    (245, "ObfReferenceObject"),
    (246, "PhyGetLinkState"),
    (247, "PhyInitialize"),
    (248, "PsCreateSystemThread"),
    (249, "PsCreateSystemThreadEx"),
    (250, "PsQueryStatistics"),
    (251, "PsSetCreateThreadNotifyRoutine"),
    (252, "PsTerminateSystemThread"),
    (253, "PsThreadObjectType"),
    (254, "RtlAnsiStringToUnicodeString"),
    (255, "RtlAppendStringToString"),
    (256, "RtlAppendUnicodeStringToString"),
    (257, "RtlAppendUnicodeToString"),
    (258, "RtlAssert"),
    (259, "RtlCaptureContext"),
    (260, "RtlCaptureStackBackTrace"),
    (261, "RtlCharToInteger"),
    (262, "RtlCompareMemory"),
    (263, "RtlCompareMemoryUlong"),
    (264, "RtlCompareString"),
    (265, "RtlCompareUnicodeString"),
    (266, "RtlCopyString"),
    (267, "RtlCopyUnicodeString"),
    (268, "RtlCreateUnicodeString"),
    (269, "RtlDowncaseUnicodeChar"),
    (270, "RtlDowncaseUnicodeString"),
    (271, "RtlEnterCriticalSection"),
    (272, "RtlEnterCriticalSectionAndRegion"),
    (273, "RtlEqualString"),
    (274, "RtlEqualUnicodeString"),
    (275, "RtlExtendedIntegerMultiply"),
    (276, "RtlExtendedLargeIntegerDivide"),
    (277, "RtlExtendedMagicDivide"),
    (278, "RtlFillMemory"),
    (279, "RtlFillMemoryUlong"),
    (280, "RtlFreeAnsiString"),
    (281, "RtlFreeUnicodeString"),
    (282, "RtlGetCallersAddress"),
    (283, "RtlInitAnsiString"),
    (284, "RtlInitUnicodeString"),
    (285, "RtlInitializeCriticalSection"),
    (286, "RtlIntegerToChar"),
    (287, "RtlIntegerToUnicodeString"),
    (288, "RtlLeaveCriticalSection"),
    (289, "RtlLeaveCriticalSectionAndRegion"),
    (290, "RtlLowerChar"),
    (291, "RtlMapGenericMask"),
    (292, "RtlMoveMemory"),
    (293, "RtlMultiByteToUnicodeN"),
    (294, "RtlMultiByteToUnicodeSize"),
    (295, "RtlNtStatusToDosError"),
    (296, "RtlRaiseException"),
    (297, "RtlRaiseStatus"),
    (298, "RtlTimeFieldsToTime"),
    (299, "RtlTimeToTimeFields"),
    (300, "RtlTryEnterCriticalSection"),
    (301, "RtlUlongByteSwap"),
    (302, "RtlUnicodeStringToAnsiString"),
    (303, "RtlUnicodeStringToInteger"),
    (304, "RtlUnicodeToMultiByteN"),
    (305, "RtlUnicodeToMultiByteSize"),
    (306, "RtlUnwind"),
    (307, "RtlUpcaseUnicodeChar"),
    (308, "RtlUpcaseUnicodeString"),
    (309, "RtlUpcaseUnicodeToMultiByteN"),
    (310, "RtlUpperChar"),
    (311, "RtlUpperString"),
    (312, "RtlUshortByteSwap"),
    (313, "RtlWalkFrameChain"),
    (314, "RtlZeroMemory"),
    (315, "XboxEEPROMKey"),
    (316, "XboxHardwareInfo"),
    (317, "XboxHDKey"),
    (318, "XboxKrnlVersion"),
    (319, "XboxSignatureKey"),
    (320, "XeImageFileName"),
    (321, "XeLoadSection"),
    (322, "XeUnloadSection"),
    (323, "READ_PORT_BUFFER_UCHAR"),
    (324, "READ_PORT_BUFFER_USHORT"),
    (325, "READ_PORT_BUFFER_ULONG"),
    (326, "WRITE_PORT_BUFFER_UCHAR"),
    (327, "WRITE_PORT_BUFFER_USHORT"),
    (328, "WRITE_PORT_BUFFER_ULONG"),
    (329, "XcSHAInit"),
    (330, "XcSHAUpdate"),
    (331, "XcSHAFinal"),
    (332, "XcRC4Key"),
    (333, "XcRC4Crypt"),
    (334, "XcHMAC"),
    (335, "XcPKEncPublic"),
    (336, "XcPKDecPrivate"),
    (337, "XcPKGetKeyLen"),
    (338, "XcVerifyPKCS1Signature"),
    (339, "XcModExp"),
    (340, "XcDESKeyParity"),
    (341, "XcKeyTable"),
    (342, "XcBlockCrypt"),
    (343, "XcBlockCryptCBC"),
    (344, "XcCryptService"),
    (345, "XcUpdateCrypto"),
    (346, "RtlRip"),
    (347, "XboxLANKey"),
    (348, "XboxAlternateSignatureKeys"),
    (349, "XePublicKeyData"),
    (350, "HalBootSMCVideoMode"),
    (351, "IdexChannelObject"),
    (352, "HalIsResetOrShutdownPending"),
    (353, "IoMarkIrpMustComplete"),
    (354, "HalInitiateShutdown"),
    (355, "RtlSnprintf"),
    (356, "RtlSprintf"),
    (357, "RtlVsnprintf"),
    (358, "RtlVsprintf"),
    (359, "HalEnableSecureTrayEject"),
    (360, "HalWriteSMCScratchRegister"),
    (361, "MmDbgAllocateMemory"),
    (362, "MmDbgFreeMemory"),
    (363, "MmDbgQueryAvailablePages"),
    (364, "MmDbgReleaseAddress"),
    (365, "MmDbgWriteCheck"),
];

lazy_static! {
    static ref KERNEL_EXPORTS: HashMap<u32, &'static str> =
        KERNEL_EXPORT_TABLE.iter().copied().collect();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_resolves_known_ordinals() {
        assert_eq!(kernel_export_name(314), Some("RtlZeroMemory"));
        assert_eq!(kernel_export_name(8), Some("DbgPrint"));
        assert_eq!(kernel_export_name(158), Some("KeWaitForSingleObject"));
        assert_eq!(kernel_export_name(9999), None);
    }
}
